//! Request and response messages of the recording protocol.
//!
//! Optional payloads travel as a `(has_payload, payload)` pair; when
//! `has_payload` is false the payload field carries a placeholder that the
//! daemon ignores.

use crate::error::ErrorReply;
use crate::types::{Payload, PayloadValue, TimerHandle};
use serde::{Deserialize, Serialize};

/// Current protocol version carried in every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// One sub-event of a recorded sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub relative_timestamp: i64,
    pub has_payload: bool,
    pub payload: PayloadValue,
}

impl SequenceEntry {
    pub fn new(relative_timestamp: i64, payload: Payload) -> Self {
        let (has_payload, payload) = split_payload(payload);
        SequenceEntry {
            relative_timestamp,
            has_payload,
            payload,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    RecordSingularEvent {
        unix_user_id: u32,
        event_id: Vec<u8>,
        relative_timestamp: i64,
        has_payload: bool,
        payload: PayloadValue,
    },
    RecordAggregateEvent {
        unix_user_id: u32,
        event_id: Vec<u8>,
        num_events: i64,
        relative_timestamp: i64,
        has_payload: bool,
        payload: PayloadValue,
    },
    RecordEventSequence {
        unix_user_id: u32,
        event_id: Vec<u8>,
        events: Vec<SequenceEntry>,
    },
    StartAggregateTimer {
        statistics_flags: u32,
        event_id: Vec<u8>,
        has_payload: bool,
        payload: PayloadValue,
    },
    StopTimer {
        handle: TimerHandle,
    },
    UploadEvents,
    GetEnabled,
    SetEnabled {
        enabled: bool,
    },
    GetUploadingEnabled,
    SetUploadingEnabled {
        enabled: bool,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::RecordSingularEvent { .. } => "RecordSingularEvent",
            Request::RecordAggregateEvent { .. } => "RecordAggregateEvent",
            Request::RecordEventSequence { .. } => "RecordEventSequence",
            Request::StartAggregateTimer { .. } => "StartAggregateTimer",
            Request::StopTimer { .. } => "StopTimer",
            Request::UploadEvents => "UploadEvents",
            Request::GetEnabled => "GetEnabled",
            Request::SetEnabled { .. } => "SetEnabled",
            Request::GetUploadingEnabled => "GetUploadingEnabled",
            Request::SetUploadingEnabled { .. } => "SetUploadingEnabled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Timer { handle: TimerHandle },
    Enabled(bool),
    Uploaded { events: u64, tallies: u64 },
    Error(ErrorReply),
}

/// Wire wrapper for every message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    pub body: T,
}

/// Splits an optional payload into its wire pair.
pub fn split_payload(payload: Payload) -> (bool, PayloadValue) {
    match payload {
        Some(value) => (true, value),
        None => (false, PayloadValue::Bool(false)),
    }
}
