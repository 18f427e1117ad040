//! Core identifiers and value types shared across the recorder.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Length in bytes of an event identifier on the wire.
pub const UUID_LENGTH: usize = 16;

/// Name mixed into an event id to derive its monthly counterpart.
const MONTHLY_LABEL: &[u8] = b"monthly";

/// Returns the current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ================================================================================================
// EVENT IDENTIFIERS
// ================================================================================================

/// 128-bit identifier naming an event type. Equality is byte-exact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    pub fn from_bytes(bytes: [u8; UUID_LENGTH]) -> Self {
        EventId(Uuid::from_bytes(bytes))
    }

    /// Builds an event id from a wire byte array, which must be exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, String> {
        let raw: [u8; UUID_LENGTH] = bytes.try_into().map_err(|_| {
            format!(
                "Event ID must be a UUID represented as an array of {} bytes, got {}",
                UUID_LENGTH,
                bytes.len()
            )
        })?;
        Ok(EventId::from_bytes(raw))
    }

    pub fn parse_str(text: &str) -> Result<Self, String> {
        Uuid::parse_str(text)
            .map(EventId)
            .map_err(|e| format!("Failed to parse event id '{}': {}", text, e))
    }

    pub fn as_bytes(&self) -> &[u8; UUID_LENGTH] {
        self.0.as_bytes()
    }

    /// Identifier under which monthly tallies of this event are kept.
    ///
    /// Derived as a SHA-1 namespaced UUID of the fixed label "monthly" within
    /// the namespace of this event id, so it can always be recomputed.
    pub fn monthly(&self) -> EventId {
        EventId(Uuid::new_v5(&self.0, MONTHLY_LABEL))
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        EventId(uuid)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

// ================================================================================================
// CONNECTION AND TIMER HANDLES
// ================================================================================================

/// Identity of one client connection for the lifetime of that connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Handle returned by `StartAggregateTimer`. Several handles may alias one timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerHandle(pub u64);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/timer/{}", self.0)
    }
}

/// Opaque statistics flags supplied when a timer is started.
///
/// Flags take part in timer identity: two starts with different flags are
/// distinct timers even for the same event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatisticsFlags(pub u32);

// ================================================================================================
// PAYLOADS
// ================================================================================================

/// A self-describing payload value attached to an event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PayloadValue {
    Bool(bool),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<PayloadValue>),
    Tuple(Vec<PayloadValue>),
}

/// An optional payload. `None` is the "no value" marker and is distinct from
/// every present value, including `Some(Bool(false))` and empty containers.
pub type Payload = Option<PayloadValue>;

/// Resolves the wire pair `(has_payload, payload)` into an optional payload.
///
/// When `has_payload` is false the carried value is a placeholder and is dropped.
pub fn payload_from_parts(has_payload: bool, payload: PayloadValue) -> Payload {
    if has_payload {
        Some(payload)
    } else {
        None
    }
}

/// Encodes a payload for storage. Absence is the empty blob; a present value
/// always encodes to at least the enum tag, so the two never collide.
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>, String> {
    match payload {
        None => Ok(Vec::new()),
        Some(value) => {
            bincode::serialize(value).map_err(|e| format!("Failed to encode payload: {}", e))
        }
    }
}

pub fn decode_payload(blob: &[u8]) -> Result<Payload, String> {
    if blob.is_empty() {
        return Ok(None);
    }
    bincode::deserialize(blob)
        .map(Some)
        .map_err(|e| format!("Failed to decode payload: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monthly_id_is_deterministic_and_distinct() {
        let id = EventId::parse_str("d84b9a19-9353-73eb-70bf-f91a584abcbd").unwrap();
        assert_eq!(id.monthly(), id.monthly());
        assert_ne!(id.monthly(), id);

        let other = EventId::parse_str("cbfbcbdb-6af2-f1db-9e11-6cc25846e296").unwrap();
        assert_ne!(id.monthly(), other.monthly());
    }

    #[test]
    fn test_event_id_from_slice_rejects_wrong_length() {
        assert!(EventId::from_slice(&[0u8; 15]).is_err());
        assert!(EventId::from_slice(&[0u8; 17]).is_err());
        assert!(EventId::from_slice(&[7u8; 16]).is_ok());
    }

    #[test]
    fn test_payload_absence_is_distinct_from_falsy_values() {
        let absent = payload_from_parts(false, PayloadValue::Bool(true));
        let falsy = payload_from_parts(true, PayloadValue::Bool(false));
        let empty = payload_from_parts(true, PayloadValue::Bytes(Vec::new()));

        assert_eq!(absent, None);
        assert_ne!(absent, falsy);
        assert_ne!(absent, empty);

        let absent_blob = encode_payload(&absent).unwrap();
        let falsy_blob = encode_payload(&falsy).unwrap();
        let empty_blob = encode_payload(&empty).unwrap();
        assert!(absent_blob.is_empty());
        assert!(!falsy_blob.is_empty());
        assert!(!empty_blob.is_empty());

        assert_eq!(decode_payload(&absent_blob).unwrap(), None);
        assert_eq!(decode_payload(&falsy_blob).unwrap(), falsy);
        assert_eq!(decode_payload(&empty_blob).unwrap(), empty);
    }
}
