//! In-memory upload buffer bounded by encoded size.

use super::event::EventRecord;
use log::warn;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Largest single request a timer-driven upload may send, and the largest
/// single event the buffer accepts.
pub const MAX_REQUEST_PAYLOAD: usize = 100_000;

pub const DEFAULT_MAX_BYTES_BUFFERED: usize = 100_000;

#[derive(Debug, Default)]
struct BufferState {
    records: Vec<EventRecord>,
    bytes: usize,
}

#[derive(Debug)]
pub struct UploadBuffer {
    max_bytes: usize,
    state: Mutex<BufferState>,
    logged_overflow: AtomicBool,
}

impl UploadBuffer {
    pub fn new(max_bytes: usize) -> Self {
        UploadBuffer {
            max_bytes,
            state: Mutex::new(BufferState::default()),
            logged_overflow: AtomicBool::new(false),
        }
    }

    /// Appends a record. Returns false when it was dropped for size.
    pub fn push(&self, record: EventRecord) -> bool {
        let cost = record.cost();
        if cost > MAX_REQUEST_PAYLOAD {
            warn!(
                "Dropping {}-byte event. The maximum permissible event size is {} bytes.",
                cost, MAX_REQUEST_PAYLOAD
            );
            return false;
        }

        let mut state = self.state.lock();
        if state.bytes + cost > self.max_bytes {
            if !self.logged_overflow.swap(true, Ordering::Relaxed) {
                warn!(
                    "The event buffer overflowed for the first time in the life of this \
                     daemon. The maximum number of bytes that may be buffered is {}.",
                    self.max_bytes
                );
            }
            return false;
        }

        state.bytes += cost;
        state.records.push(record);
        true
    }

    /// Removes records from the front, oldest first, while their total cost
    /// stays within `max_bytes`. `None` takes everything.
    pub fn take(&self, max_bytes: Option<usize>) -> Vec<EventRecord> {
        let mut state = self.state.lock();
        let limit = max_bytes.unwrap_or(usize::MAX);

        let mut taken_bytes = 0usize;
        let mut count = 0usize;
        for record in &state.records {
            let cost = record.cost();
            if taken_bytes + cost > limit {
                break;
            }
            taken_bytes += cost;
            count += 1;
        }

        state.bytes -= taken_bytes;
        state.records.drain(..count).collect()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.records.clear();
        state.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.state.lock().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::event::SingularEvent;
    use crate::types::{EventId, PayloadValue};

    fn singular(payload_len: usize) -> EventRecord {
        EventRecord::Singular(SingularEvent {
            unix_user_id: 1000,
            event_id: EventId::from_bytes([1; 16]),
            relative_timestamp: 5,
            payload: Some(PayloadValue::Bytes(vec![0; payload_len])),
        })
    }

    #[test]
    fn test_push_respects_limit() {
        let record = singular(10);
        let cost = record.cost();
        let buffer = UploadBuffer::new(cost * 2);

        assert!(buffer.push(record.clone()));
        assert!(buffer.push(record.clone()));
        assert!(!buffer.push(record));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.bytes(), cost * 2);
    }

    #[test]
    fn test_oversized_event_is_dropped() {
        let buffer = UploadBuffer::new(usize::MAX);
        assert!(!buffer.push(singular(MAX_REQUEST_PAYLOAD + 1)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_is_ordered_and_bounded() {
        let first = singular(1);
        let cost = first.cost();
        let buffer = UploadBuffer::new(DEFAULT_MAX_BYTES_BUFFERED);
        buffer.push(first.clone());
        buffer.push(singular(1));
        buffer.push(singular(1));

        let taken = buffer.take(Some(cost * 2));
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0], first);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.bytes(), cost);

        assert_eq!(buffer.take(None).len(), 1);
        assert_eq!(buffer.bytes(), 0);
    }
}
