//! # Event Recorder
//!
//! Entry point for every recording call. Validates arguments, stamps relative
//! timestamps through the connection's guard, and routes the result into the
//! upload buffer or the timer registry. Each side effect runs under the
//! permission gate's read lock.

use super::buffer::UploadBuffer;
use super::event::{AggregateEvent, EventRecord, SequenceEvent, SequencePoint, SingularEvent};
use super::timers::{TimerRegistry, TimerStart};
use crate::clock::{Clock, TimestampGuard};
use crate::error::{RecorderError, RecorderResult};
use crate::permissions::{ClientCredentials, PermissionGate};
use crate::storage::{TallyIncrement, TallyStore};
use crate::types::{ClientId, EventId, Payload, StatisticsFlags, TimerHandle};
use chrono::NaiveDate;
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Per-connection state carried through every call on that connection.
#[derive(Debug)]
pub struct ClientSession {
    pub client_id: ClientId,
    pub credentials: ClientCredentials,
    guard: TimestampGuard,
}

impl ClientSession {
    pub fn new(client_id: ClientId, credentials: ClientCredentials) -> Self {
        ClientSession {
            client_id,
            credentials,
            guard: TimestampGuard::new(),
        }
    }

    fn stamp(&mut self, client_ns: i64, now_ns: i64) -> i64 {
        self.guard.apply(client_ns, now_ns)
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.guard.last()
    }
}

pub struct EventRecorder {
    gate: Arc<PermissionGate>,
    timers: Arc<TimerRegistry>,
    tally: Arc<TallyStore>,
    buffer: Arc<UploadBuffer>,
    clock: Arc<dyn Clock>,
}

impl EventRecorder {
    pub fn new(
        gate: Arc<PermissionGate>,
        timers: Arc<TimerRegistry>,
        tally: Arc<TallyStore>,
        buffer: Arc<UploadBuffer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        EventRecorder {
            gate,
            timers,
            tally,
            buffer,
            clock,
        }
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    // ============================================================================================
    // BUFFERED EVENTS
    // ============================================================================================

    pub fn record_singular(
        &self,
        session: &mut ClientSession,
        unix_user_id: u32,
        event_id: &[u8],
        relative_timestamp: i64,
        payload: Payload,
    ) -> RecorderResult<()> {
        self.gate.with_enabled(|| {
            let event_id = parse_event_id(event_id)?;
            let relative_timestamp = session.stamp(relative_timestamp, self.clock.boottime_ns());
            self.buffer.push(EventRecord::Singular(SingularEvent {
                unix_user_id,
                event_id,
                relative_timestamp,
                payload,
            }));
            Ok(())
        })
    }

    pub fn record_aggregate(
        &self,
        session: &mut ClientSession,
        unix_user_id: u32,
        event_id: &[u8],
        num_events: i64,
        relative_timestamp: i64,
        payload: Payload,
    ) -> RecorderResult<()> {
        self.gate.with_enabled(|| {
            let event_id = parse_event_id(event_id)?;
            if num_events < 0 {
                return Err(RecorderError::InvalidArgument(format!(
                    "Event count must be non-negative, got {}",
                    num_events
                )));
            }
            let relative_timestamp = session.stamp(relative_timestamp, self.clock.boottime_ns());
            self.buffer.push(EventRecord::Aggregate(AggregateEvent {
                unix_user_id,
                event_id,
                num_events,
                relative_timestamp,
                payload,
            }));
            Ok(())
        })
    }

    /// Records a completed sequence. Point timestamps pass through the
    /// connection guard in order.
    pub fn record_sequence(
        &self,
        session: &mut ClientSession,
        unix_user_id: u32,
        event_id: &[u8],
        points: Vec<(i64, Payload)>,
    ) -> RecorderResult<()> {
        self.gate.with_enabled(|| {
            let event_id = parse_event_id(event_id)?;
            if points.is_empty() {
                return Err(RecorderError::InvalidArgument(
                    "Event sequence must contain at least one event".to_string(),
                ));
            }

            let now_ns = self.clock.boottime_ns();
            let points = points
                .into_iter()
                .map(|(relative_timestamp, payload)| SequencePoint {
                    relative_timestamp: session.stamp(relative_timestamp, now_ns),
                    payload,
                })
                .collect();

            self.buffer.push(EventRecord::Sequence(SequenceEvent {
                unix_user_id,
                event_id,
                points,
            }));
            Ok(())
        })
    }

    // ============================================================================================
    // AGGREGATE TIMERS
    // ============================================================================================

    /// Starts a timer owned by this connection; the uid comes from the peer
    /// credentials.
    ///
    /// # Returns
    /// The new handle, `Disabled` while metrics are off, or
    /// `InvalidArgument` for an event id that is not 16 bytes.
    ///
    /// # Example
    /// ```rust,ignore
    /// let handle = recorder.start_timer(&session, StatisticsFlags(0), &[3; 16], None)?;
    /// clock.advance(Duration::from_secs(6));
    /// recorder.stop_timer(&session, handle)?;
    /// ```
    pub fn start_timer(
        &self,
        session: &ClientSession,
        flags: StatisticsFlags,
        event_id: &[u8],
        payload: Payload,
    ) -> RecorderResult<TimerHandle> {
        self.gate.with_enabled(|| {
            let event_id = parse_event_id(event_id)?;
            let handle = self.timers.start(TimerStart {
                client: session.client_id,
                unix_user_id: session.credentials.uid,
                event_id,
                flags,
                payload,
            });
            debug!("{} started timer {} for {}", session.client_id, handle, event_id);
            Ok(handle)
        })
    }

    /// Releases one handle and commits the timer once its last handle is gone.
    ///
    /// The handle is resolved before consent is consulted: a revocation has
    /// already emptied the registry, so a handle from before it reports
    /// `UnknownHandle` rather than `Disabled`. The commit itself only lands
    /// if no revocation happened in between.
    pub fn stop_timer(&self, session: &ClientSession, handle: TimerHandle) -> RecorderResult<()> {
        let generation = self.gate.generation();
        match self.timers.stop(session.client_id, handle)? {
            Some(increment) => self
                .gate
                .with_generation(generation, || self.commit(std::slice::from_ref(&increment))),
            None => Ok(()),
        }
    }

    /// Commits every timer the connection still owns.
    pub fn disconnect(&self, session: &ClientSession) {
        let result = self.gate.with_enabled(|| {
            let increments = self.timers.disconnect(session.client_id);
            if !increments.is_empty() {
                info!(
                    "{} disconnected with {} running timer(s)",
                    session.client_id,
                    increments.len()
                );
            }
            self.commit(&increments)
        });
        match result {
            Ok(()) | Err(RecorderError::Disabled) => {}
            Err(e) => error!("Failed to commit timers of {}: {}", session.client_id, e),
        }
    }

    /// Closes running timer intervals against `previous_day` after the
    /// calendar date has moved on.
    pub fn split_timers(&self, previous_day: NaiveDate) -> RecorderResult<usize> {
        self.gate.with_enabled(|| {
            let increments = self.timers.split_all(previous_day);
            self.commit(&increments)?;
            Ok(increments.len())
        })
    }

    /// Commits every running timer in one transaction. Used at shutdown.
    pub fn commit_all_timers(&self) -> RecorderResult<usize> {
        self.gate.with_enabled(|| {
            let increments = self.timers.drain();
            self.commit(&increments)?;
            Ok(increments.len())
        })
    }

    fn commit(&self, increments: &[TallyIncrement]) -> RecorderResult<()> {
        self.tally.commit(increments).map_err(|e| {
            warn!("Tally commit failed: {}", e);
            RecorderError::Storage(e)
        })
    }
}

fn parse_event_id(bytes: &[u8]) -> RecorderResult<EventId> {
    EventId::from_slice(bytes).map_err(RecorderError::InvalidArgument)
}
