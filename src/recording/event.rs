//! Records buffered for upload.

use crate::types::{EventId, Payload};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SingularEvent {
    pub unix_user_id: u32,
    pub event_id: EventId,
    pub relative_timestamp: i64,
    pub payload: Payload,
}

/// One occurrence reported with a repeat count.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateEvent {
    pub unix_user_id: u32,
    pub event_id: EventId,
    pub num_events: i64,
    pub relative_timestamp: i64,
    pub payload: Payload,
}

/// A start, progress, or stop point within a sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequencePoint {
    pub relative_timestamp: i64,
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceEvent {
    pub unix_user_id: u32,
    pub event_id: EventId,
    pub points: Vec<SequencePoint>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventRecord {
    Singular(SingularEvent),
    Aggregate(AggregateEvent),
    Sequence(SequenceEvent),
}

impl EventRecord {
    pub fn event_id(&self) -> &EventId {
        match self {
            EventRecord::Singular(e) => &e.event_id,
            EventRecord::Aggregate(e) => &e.event_id,
            EventRecord::Sequence(e) => &e.event_id,
        }
    }

    /// Bytes this record occupies once encoded; used for buffer accounting.
    pub fn cost(&self) -> usize {
        bincode::serialized_size(self)
            .map(|n| n as usize)
            .unwrap_or(usize::MAX)
    }
}
