//! # Timer Registry
//!
//! Live aggregate timers, indexed three ways:
//! - by identity `(client, event id, statistics flags)`
//! - by handle, since several handles may alias one timer
//! - by owning client, so a disconnect can sweep everything it owns
//!
//! The registry never touches the tally store itself. Operations that end a
//! timer return the [`TallyIncrement`]s to commit; the caller commits them
//! while still holding the permission gate's read lock.

use crate::clock::Clock;
use crate::error::{RecorderError, RecorderResult};
use crate::storage::TallyIncrement;
use crate::types::{ClientId, EventId, Payload, StatisticsFlags, TimerHandle};
use chrono::NaiveDate;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TimerKey {
    client: ClientId,
    event_id: EventId,
    flags: StatisticsFlags,
}

#[derive(Debug)]
struct AggregateTimer {
    unix_user_id: u32,
    /// Payload of the first start; later identical starts do not replace it.
    payload: Payload,
    start_ns: i64,
    handles: HashSet<TimerHandle>,
}

impl AggregateTimer {
    fn refcount(&self) -> usize {
        self.handles.len()
    }
}

/// Arguments of a timer start.
#[derive(Clone, Debug)]
pub struct TimerStart {
    pub client: ClientId,
    pub unix_user_id: u32,
    pub event_id: EventId,
    pub flags: StatisticsFlags,
    pub payload: Payload,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_handle: u64,
    timers: HashMap<TimerKey, AggregateTimer>,
    handles: HashMap<TimerHandle, TimerKey>,
    by_client: HashMap<ClientId, HashSet<TimerKey>>,
}

impl RegistryState {
    fn remove_timer(&mut self, key: &TimerKey) -> Option<AggregateTimer> {
        let timer = self.timers.remove(key)?;
        for handle in &timer.handles {
            self.handles.remove(handle);
        }
        if let Some(owned) = self.by_client.get_mut(&key.client) {
            owned.remove(key);
            if owned.is_empty() {
                self.by_client.remove(&key.client);
            }
        }
        Some(timer)
    }
}

pub struct TimerRegistry {
    clock: Arc<dyn Clock>,
    state: Mutex<RegistryState>,
}

impl TimerRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        TimerRegistry {
            clock,
            state: Mutex::new(RegistryState {
                next_handle: 1,
                ..RegistryState::default()
            }),
        }
    }

    /// Starts a timer, or stacks another reference onto an identical running
    /// one. Every call returns a fresh handle.
    ///
    /// # Arguments
    /// - `start`: Owning client, uid, event id, and payload. Two starts with
    ///   the same key share one timer
    ///
    /// # Returns
    /// A handle that only the owning client may stop.
    pub fn start(&self, start: TimerStart) -> TimerHandle {
        let now_ns = self.clock.boottime_ns();
        let mut state = self.state.lock();

        let handle = TimerHandle(state.next_handle);
        state.next_handle += 1;

        let key = TimerKey {
            client: start.client,
            event_id: start.event_id,
            flags: start.flags,
        };

        let timer = state
            .timers
            .entry(key.clone())
            .or_insert_with(|| AggregateTimer {
                unix_user_id: start.unix_user_id,
                payload: start.payload,
                start_ns: now_ns,
                handles: HashSet::new(),
            });
        timer.handles.insert(handle);
        debug!(
            "Timer {} for event {} now has {} reference(s)",
            handle,
            key.event_id,
            timer.refcount()
        );

        state.handles.insert(handle, key.clone());
        state.by_client.entry(key.client).or_default().insert(key);
        handle
    }

    /// Releases one handle. Returns the increment to commit when this was the
    /// last reference.
    pub fn stop(&self, client: ClientId, handle: TimerHandle) -> RecorderResult<Option<TallyIncrement>> {
        let now_ns = self.clock.boottime_ns();
        let today = self.clock.today();
        let mut state = self.state.lock();

        let key = match state.handles.get(&handle) {
            Some(key) if key.client == client => key.clone(),
            _ => return Err(RecorderError::UnknownHandle(handle)),
        };

        state.handles.remove(&handle);
        let remaining = match state.timers.get_mut(&key) {
            Some(timer) => {
                timer.handles.remove(&handle);
                timer.refcount()
            }
            None => return Err(RecorderError::UnknownHandle(handle)),
        };
        if remaining > 0 {
            return Ok(None);
        }

        Ok(state
            .remove_timer(&key)
            .map(|timer| increment_for(&key, &timer, now_ns, today)))
    }

    /// Ends every timer owned by `client`.
    pub fn disconnect(&self, client: ClientId) -> Vec<TallyIncrement> {
        let now_ns = self.clock.boottime_ns();
        let today = self.clock.today();
        let mut state = self.state.lock();

        let keys = state.by_client.remove(&client).unwrap_or_default();
        let mut increments = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(timer) = state.remove_timer(&key) {
                increments.push(increment_for(&key, &timer, now_ns, today));
            }
        }
        increments
    }

    /// Ends every timer. Used at shutdown.
    pub fn drain(&self) -> Vec<TallyIncrement> {
        let now_ns = self.clock.boottime_ns();
        let today = self.clock.today();
        let mut state = self.state.lock();

        state.handles.clear();
        state.by_client.clear();
        state
            .timers
            .drain()
            .map(|(key, timer)| increment_for(&key, &timer, now_ns, today))
            .collect()
    }

    /// Drops every timer without producing increments. Returns how many.
    pub fn purge(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.timers.len();
        state.timers.clear();
        state.handles.clear();
        state.by_client.clear();
        count
    }

    /// Closes the running interval of every timer against `date` and restarts
    /// each timer's clock. Handles and refcounts are untouched.
    pub fn split_all(&self, date: NaiveDate) -> Vec<TallyIncrement> {
        let now_ns = self.clock.boottime_ns();
        let mut state = self.state.lock();

        state
            .timers
            .iter_mut()
            .map(|(key, timer)| {
                let increment = increment_for(key, timer, now_ns, date);
                timer.start_ns = now_ns;
                increment
            })
            .collect()
    }

    /// Number of distinct running timers.
    pub fn len(&self) -> usize {
        self.state.lock().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live handles across all timers.
    pub fn handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }
}

fn increment_for(
    key: &TimerKey,
    timer: &AggregateTimer,
    now_ns: i64,
    date: NaiveDate,
) -> TallyIncrement {
    let elapsed_secs = (now_ns - timer.start_ns).max(0) / NANOS_PER_SECOND;
    TallyIncrement {
        event_id: key.event_id,
        date,
        unix_user_id: timer.unix_user_id,
        payload: timer.payload.clone(),
        amount: u32::try_from(elapsed_secs).unwrap_or(u32::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::PayloadValue;
    use std::time::Duration;

    fn setup() -> (Arc<ManualClock>, TimerRegistry) {
        let clock = Arc::new(ManualClock::new(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()));
        let registry = TimerRegistry::new(clock.clone());
        (clock, registry)
    }

    fn start(client: u64, payload: Payload) -> TimerStart {
        TimerStart {
            client: ClientId(client),
            unix_user_id: 1000,
            event_id: EventId::from_bytes([9; 16]),
            flags: StatisticsFlags(0),
            payload,
        }
    }

    #[test]
    fn test_start_stop_commits_elapsed_seconds() {
        let (clock, registry) = setup();
        let handle = registry.start(start(1, None));
        clock.advance(Duration::from_millis(3_700));

        let increment = registry.stop(ClientId(1), handle).unwrap().unwrap();
        assert_eq!(increment.amount, 3);
        assert_eq!(increment.date, clock.today());
        assert!(registry.is_empty());
        assert_eq!(
            registry.stop(ClientId(1), handle),
            Err(RecorderError::UnknownHandle(handle))
        );
    }

    #[test]
    fn test_identical_starts_share_one_timer() {
        let (clock, registry) = setup();
        let first = registry.start(start(1, Some(PayloadValue::Int32(1))));
        let second = registry.start(start(1, Some(PayloadValue::Int32(2))));
        assert_ne!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.handle_count(), 2);

        clock.advance(Duration::from_secs(5));
        assert_eq!(registry.stop(ClientId(1), first).unwrap(), None);

        let increment = registry.stop(ClientId(1), second).unwrap().unwrap();
        assert_eq!(increment.amount, 5);
        assert_eq!(increment.payload, Some(PayloadValue::Int32(1)));
    }

    #[test]
    fn test_flags_and_clients_separate_timers() {
        let (_, registry) = setup();
        registry.start(start(1, None));
        registry.start(start(2, None));
        let mut flagged = start(1, None);
        flagged.flags = StatisticsFlags(4);
        registry.start(flagged);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_foreign_client_cannot_stop() {
        let (_, registry) = setup();
        let handle = registry.start(start(1, None));
        assert_eq!(
            registry.stop(ClientId(2), handle),
            Err(RecorderError::UnknownHandle(handle))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_disconnect_sweeps_owned_timers() {
        let (clock, registry) = setup();
        let handle = registry.start(start(1, None));
        registry.start(start(1, None));
        registry.start(start(2, None));
        clock.advance(Duration::from_secs(2));

        let increments = registry.disconnect(ClientId(1));
        assert_eq!(increments.len(), 1);
        assert_eq!(increments[0].amount, 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.stop(ClientId(1), handle).is_err());
    }

    #[test]
    fn test_purge_discards_everything() {
        let (_, registry) = setup();
        let handle = registry.start(start(1, None));
        assert_eq!(registry.purge(), 1);
        assert!(registry.stop(ClientId(1), handle).is_err());
        assert!(registry.drain().is_empty());
    }

    #[test]
    fn test_split_restarts_clock() {
        let (clock, registry) = setup();
        let handle = registry.start(start(1, None));
        clock.advance(Duration::from_secs(10));

        let yesterday = clock.today();
        clock.set_today(yesterday.succ_opt().unwrap());
        let split = registry.split_all(yesterday);
        assert_eq!(split.len(), 1);
        assert_eq!(split[0].amount, 10);
        assert_eq!(split[0].date, yesterday);

        clock.advance(Duration::from_secs(4));
        let increment = registry.stop(ClientId(1), handle).unwrap().unwrap();
        assert_eq!(increment.amount, 4);
        assert_eq!(increment.date, clock.today());
    }

    #[test]
    fn test_amount_clamps_to_u32() {
        let (clock, registry) = setup();
        registry.start(start(1, None));
        clock.advance(Duration::from_secs(u32::MAX as u64 + 10));
        let drained = registry.drain();
        assert_eq!(drained[0].amount, u32::MAX);
    }
}
