//! Client library for the recording protocol.
//!
//! Relative timestamps are sampled from the boot clock once per call, on the
//! client side, so they reflect when the event happened rather than when the
//! daemon got around to reading it.

use super::framing::{read_message, write_message};
use super::messages::{split_payload, Request, Response, SequenceEntry};
use crate::clock::{Clock, SystemClock};
use crate::error::{RecorderError, RecorderResult};
use crate::types::{EventId, Payload, StatisticsFlags, TimerHandle};
use std::path::Path;
use tokio::net::UnixStream;

pub struct RecorderClient {
    stream: UnixStream,
    clock: SystemClock,
}

impl RecorderClient {
    pub async fn connect(socket_path: &Path) -> RecorderResult<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            RecorderError::Protocol(format!(
                "Failed to connect to {}: {}",
                socket_path.display(),
                e
            ))
        })?;
        Ok(RecorderClient {
            stream,
            clock: SystemClock,
        })
    }

    /// Sends one request and waits for its response. Error responses are
    /// returned as `Ok(Response::Error(..))`.
    pub async fn send_raw(&mut self, request: Request) -> RecorderResult<Response> {
        write_message(&mut self.stream, &request)
            .await
            .map_err(|e| RecorderError::Protocol(e.to_string()))?;
        read_message(&mut self.stream)
            .await
            .map_err(|e| RecorderError::Protocol(e.to_string()))?
            .ok_or_else(|| RecorderError::Protocol("connection closed by daemon".to_string()))
    }

    async fn call(&mut self, request: Request) -> RecorderResult<Response> {
        match self.send_raw(request).await? {
            Response::Error(reply) => Err(reply.into()),
            response => Ok(response),
        }
    }

    async fn call_ok(&mut self, request: Request) -> RecorderResult<()> {
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn call_flag(&mut self, request: Request) -> RecorderResult<bool> {
        match self.call(request).await? {
            Response::Enabled(flag) => Ok(flag),
            other => Err(unexpected(other)),
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.boottime_ns()
    }

    pub async fn record_singular_event(
        &mut self,
        unix_user_id: u32,
        event_id: EventId,
        payload: Payload,
    ) -> RecorderResult<()> {
        let relative_timestamp = self.now();
        let (has_payload, payload) = split_payload(payload);
        self.call_ok(Request::RecordSingularEvent {
            unix_user_id,
            event_id: event_id.as_bytes().to_vec(),
            relative_timestamp,
            has_payload,
            payload,
        })
        .await
    }

    pub async fn record_aggregate_event(
        &mut self,
        unix_user_id: u32,
        event_id: EventId,
        num_events: i64,
        payload: Payload,
    ) -> RecorderResult<()> {
        let relative_timestamp = self.now();
        let (has_payload, payload) = split_payload(payload);
        self.call_ok(Request::RecordAggregateEvent {
            unix_user_id,
            event_id: event_id.as_bytes().to_vec(),
            num_events,
            relative_timestamp,
            has_payload,
            payload,
        })
        .await
    }

    pub async fn record_event_sequence(
        &mut self,
        unix_user_id: u32,
        event_id: EventId,
        events: Vec<SequenceEntry>,
    ) -> RecorderResult<()> {
        self.call_ok(Request::RecordEventSequence {
            unix_user_id,
            event_id: event_id.as_bytes().to_vec(),
            events,
        })
        .await
    }

    pub async fn start_aggregate_timer(
        &mut self,
        flags: StatisticsFlags,
        event_id: EventId,
        payload: Payload,
    ) -> RecorderResult<TimerHandle> {
        let (has_payload, payload) = split_payload(payload);
        match self
            .call(Request::StartAggregateTimer {
                statistics_flags: flags.0,
                event_id: event_id.as_bytes().to_vec(),
                has_payload,
                payload,
            })
            .await?
        {
            Response::Timer { handle } => Ok(handle),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stop_timer(&mut self, handle: TimerHandle) -> RecorderResult<()> {
        self.call_ok(Request::StopTimer { handle }).await
    }

    /// Returns `(events, tallies)` uploaded.
    pub async fn upload_events(&mut self) -> RecorderResult<(u64, u64)> {
        match self.call(Request::UploadEvents).await? {
            Response::Uploaded { events, tallies } => Ok((events, tallies)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_enabled(&mut self) -> RecorderResult<bool> {
        self.call_flag(Request::GetEnabled).await
    }

    pub async fn set_enabled(&mut self, enabled: bool) -> RecorderResult<()> {
        self.call_ok(Request::SetEnabled { enabled }).await
    }

    pub async fn get_uploading_enabled(&mut self) -> RecorderResult<bool> {
        self.call_flag(Request::GetUploadingEnabled).await
    }

    pub async fn set_uploading_enabled(&mut self, enabled: bool) -> RecorderResult<()> {
        self.call_ok(Request::SetUploadingEnabled { enabled }).await
    }
}

fn unexpected(response: Response) -> RecorderError {
    RecorderError::Protocol(format!("unexpected response {:?}", response))
}

/// Client-side builder for an event sequence. Points are timestamped when
/// they are added; nothing reaches the daemon until [`EventSequence::stop`].
#[derive(Debug, Clone)]
pub struct EventSequence {
    unix_user_id: u32,
    event_id: EventId,
    entries: Vec<SequenceEntry>,
    clock: SystemClock,
}

impl EventSequence {
    pub fn start(unix_user_id: u32, event_id: EventId, payload: Payload) -> Self {
        let clock = SystemClock;
        EventSequence {
            unix_user_id,
            event_id,
            entries: vec![SequenceEntry::new(clock.boottime_ns(), payload)],
            clock,
        }
    }

    pub fn progress(&mut self, payload: Payload) {
        self.entries
            .push(SequenceEntry::new(self.clock.boottime_ns(), payload));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds the final point and sends the whole sequence as one record.
    pub async fn stop(mut self, client: &mut RecorderClient, payload: Payload) -> RecorderResult<()> {
        self.entries
            .push(SequenceEntry::new(self.clock.boottime_ns(), payload));
        client
            .record_event_sequence(self.unix_user_id, self.event_id, self.entries)
            .await
    }
}
