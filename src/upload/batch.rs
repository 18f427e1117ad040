//! Upload batch format and the small state files that feed it.
//!
//! A batch is bincode-encoded and then gzip-compressed. The send number and
//! both timestamps are refreshed on every attempt.

use crate::clock::Clock;
use crate::keyfile::KeyFile;
use crate::recording::{AggregateEvent, EventRecord, SequenceEvent, SingularEvent};
use crate::storage::TallyRow;
use crate::types::{EventId, Payload};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Version segment of the collector URL.
pub const CLIENT_VERSION: &str = "2";

pub const NETWORK_SEND_FILE_NAME: &str = "network_send_file";
const NETWORK_SEND_GROUP: &str = "network_send_data";
const NETWORK_SEND_KEY: &str = "network_requests_sent";

pub const DEFAULT_MACHINE_ID_PATH: &str = "/etc/machine-id";

/// A closed tally bucket reported as an aggregate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TallyAggregate {
    pub unix_user_id: u32,
    pub event_id: EventId,
    /// `YYYY-MM-DD` or `YYYY-MM`.
    pub period: String,
    pub count: u32,
    pub payload: Payload,
}

impl From<&TallyRow> for TallyAggregate {
    fn from(row: &TallyRow) -> Self {
        TallyAggregate {
            unix_user_id: row.unix_user_id,
            event_id: row.event_id,
            period: row.bucket_key.clone(),
            count: row.counter,
            payload: row.payload.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadBatch {
    pub send_number: u64,
    /// Boot-clock nanoseconds at send time.
    pub relative_timestamp: i64,
    /// Wall-clock milliseconds at send time.
    pub absolute_timestamp: i64,
    pub machine_id: Uuid,
    pub singulars: Vec<SingularEvent>,
    pub aggregates: Vec<AggregateEvent>,
    pub sequences: Vec<SequenceEvent>,
    pub tallies: Vec<TallyAggregate>,
}

impl UploadBatch {
    pub fn new(
        machine_id: Uuid,
        records: impl IntoIterator<Item = EventRecord>,
        tallies: Vec<TallyAggregate>,
    ) -> Self {
        let mut batch = UploadBatch {
            machine_id,
            tallies,
            ..UploadBatch::default()
        };
        for record in records {
            match record {
                EventRecord::Singular(e) => batch.singulars.push(e),
                EventRecord::Aggregate(e) => batch.aggregates.push(e),
                EventRecord::Sequence(e) => batch.sequences.push(e),
            }
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.singulars.is_empty()
            && self.aggregates.is_empty()
            && self.sequences.is_empty()
            && self.tallies.is_empty()
    }

    pub fn event_count(&self) -> usize {
        self.singulars.len() + self.aggregates.len() + self.sequences.len() + self.tallies.len()
    }

    /// Refreshes the send-time fields.
    pub fn stamp(&mut self, send_number: u64, clock: &dyn Clock) {
        self.send_number = send_number;
        self.relative_timestamp = clock.boottime_ns();
        self.absolute_timestamp = clock.realtime_ms();
    }

    /// Serializes and gzip-compresses the batch.
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        let raw =
            bincode::serialize(self).map_err(|e| format!("Failed to serialize batch: {}", e))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&raw)
            .map_err(|e| format!("Failed to compress batch: {}", e))?;
        encoder
            .finish()
            .map_err(|e| format!("Failed to finish compression: {}", e))
    }

    pub fn decode(body: &[u8]) -> Result<Self, String> {
        let mut raw = Vec::new();
        GzDecoder::new(body)
            .read_to_end(&mut raw)
            .map_err(|e| format!("Failed to decompress batch: {}", e))?;
        bincode::deserialize(&raw).map_err(|e| format!("Failed to deserialize batch: {}", e))
    }
}

/// Reads the host machine id, falling back to the nil UUID.
pub fn read_machine_id(path: &Path) -> Uuid {
    match std::fs::read_to_string(path) {
        Ok(text) => Uuid::parse_str(text.trim()).unwrap_or_else(|e| {
            warn!("Invalid machine id in {}: {}", path.display(), e);
            Uuid::nil()
        }),
        Err(e) => {
            warn!("Could not read machine id from {}: {}", path.display(), e);
            Uuid::nil()
        }
    }
}

/// Persistent count of network requests sent.
#[derive(Debug, Clone)]
pub struct SendCounter {
    path: PathBuf,
}

impl SendCounter {
    pub fn new(path: PathBuf) -> Self {
        SendCounter { path }
    }

    pub fn current(&self) -> Result<u64, String> {
        Ok(KeyFile::load(&self.path)?
            .map(|file| file.get_u64(NETWORK_SEND_GROUP, NETWORK_SEND_KEY))
            .transpose()?
            .flatten()
            .unwrap_or(0))
    }

    /// Returns the current send number and persists its successor.
    pub fn next(&self) -> Result<u64, String> {
        let current = self.current()?;
        let mut file = KeyFile::new();
        file.set(NETWORK_SEND_GROUP, NETWORK_SEND_KEY, current + 1);
        file.save_atomic(&self.path)?;
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::PayloadValue;
    use chrono::NaiveDate;

    #[test]
    fn test_batch_splits_records_and_survives_encoding() {
        let id = EventId::from_bytes([4; 16]);
        let records = vec![
            EventRecord::Singular(SingularEvent {
                unix_user_id: 1,
                event_id: id,
                relative_timestamp: 10,
                payload: None,
            }),
            EventRecord::Aggregate(AggregateEvent {
                unix_user_id: 1,
                event_id: id,
                num_events: 3,
                relative_timestamp: 11,
                payload: Some(PayloadValue::UInt32(7)),
            }),
        ];
        let mut batch = UploadBatch::new(Uuid::nil(), records, Vec::new());
        assert_eq!(batch.singulars.len(), 1);
        assert_eq!(batch.aggregates.len(), 1);
        assert_eq!(batch.event_count(), 2);

        let clock = ManualClock::new(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        batch.stamp(5, &clock);
        assert_eq!(batch.send_number, 5);

        let body = batch.encode().unwrap();
        assert_eq!(&body[..2], &[0x1f, 0x8b]);
        assert_eq!(UploadBatch::decode(&body).unwrap(), batch);
    }

    #[test]
    fn test_send_counter_persists() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let counter = SendCounter::new(tmp_dir.path().join(NETWORK_SEND_FILE_NAME));
        assert_eq!(counter.next().unwrap(), 0);
        assert_eq!(counter.next().unwrap(), 1);

        let reopened = SendCounter::new(tmp_dir.path().join(NETWORK_SEND_FILE_NAME));
        assert_eq!(reopened.current().unwrap(), 2);
    }

    #[test]
    fn test_machine_id_fallback() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("machine-id");
        assert_eq!(read_machine_id(&path), Uuid::nil());

        std::fs::write(&path, "0123456789abcdef0123456789abcdef\n").unwrap();
        assert_eq!(
            read_machine_id(&path),
            Uuid::parse_str("0123456789abcdef0123456789abcdef").unwrap()
        );
    }
}
