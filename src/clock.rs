//! Clock sources for relative timestamps and calendar buckets.
//!
//! Relative timestamps are nanoseconds on the system-wide boot clock, which
//! keeps counting across suspend and is shared by every process on the host,
//! so a client's reading and the daemon's reading are directly comparable.

use chrono::{Local, NaiveDate};
use log::warn;
use nix::time::{clock_gettime, ClockId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of monotonic and calendar time.
pub trait Clock: Send + Sync {
    /// Nanoseconds on the boot clock.
    fn boottime_ns(&self) -> i64;

    /// Milliseconds since the UNIX epoch.
    fn realtime_ms(&self) -> i64;

    /// Local calendar date used to pick tally buckets.
    fn today(&self) -> NaiveDate;
}

/// Reads the host clocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

fn read_clock_ns(id: ClockId) -> Option<i64> {
    clock_gettime(id)
        .ok()
        .map(|ts| ts.tv_sec() as i64 * 1_000_000_000 + ts.tv_nsec() as i64)
}

impl Clock for SystemClock {
    fn boottime_ns(&self) -> i64 {
        read_clock_ns(ClockId::CLOCK_BOOTTIME)
            .or_else(|| {
                warn!("CLOCK_BOOTTIME unavailable, falling back to CLOCK_MONOTONIC");
                read_clock_ns(ClockId::CLOCK_MONOTONIC)
            })
            .unwrap_or(0)
    }

    fn realtime_ms(&self) -> i64 {
        Local::now().timestamp_millis()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    boottime_ns: AtomicI64,
    realtime_ms: AtomicI64,
    today: Mutex<NaiveDate>,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        ManualClock {
            boottime_ns: AtomicI64::new(1_000_000_000),
            realtime_ms: AtomicI64::new(1_700_000_000_000),
            today: Mutex::new(today),
        }
    }

    /// Moves both the boot clock and the wall clock forward.
    pub fn advance(&self, by: Duration) {
        self.boottime_ns
            .fetch_add(by.as_nanos() as i64, Ordering::SeqCst);
        self.realtime_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set_today(&self, date: NaiveDate) {
        *self.today.lock() = date;
    }
}

impl Clock for ManualClock {
    fn boottime_ns(&self) -> i64 {
        self.boottime_ns.load(Ordering::SeqCst)
    }

    fn realtime_ms(&self) -> i64 {
        self.realtime_ms.load(Ordering::SeqCst)
    }

    fn today(&self) -> NaiveDate {
        *self.today.lock()
    }
}

/// Per-connection guard over client-supplied relative timestamps.
///
/// Stamps handed out by one guard never decrease, and never run ahead of the
/// daemon's own clock sample taken during the same call.
#[derive(Debug, Default, Clone)]
pub struct TimestampGuard {
    last: Option<i64>,
}

impl TimestampGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, client_ns: i64, now_ns: i64) -> i64 {
        let floor = self.last.unwrap_or(i64::MIN);
        let stamped = client_ns.max(floor).min(now_ns.max(floor));
        self.last = Some(stamped);
        stamped
    }

    pub fn last(&self) -> Option<i64> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_never_decreases() {
        let mut guard = TimestampGuard::new();
        assert_eq!(guard.apply(100, 1_000), 100);
        assert_eq!(guard.apply(50, 1_000), 100);
        assert_eq!(guard.apply(300, 1_000), 300);
    }

    #[test]
    fn test_guard_clamps_to_daemon_clock() {
        let mut guard = TimestampGuard::new();
        assert_eq!(guard.apply(5_000, 1_000), 1_000);
        // A later call whose daemon sample lags the floor keeps the floor.
        assert_eq!(guard.apply(10, 900), 1_000);
    }

    #[test]
    fn test_manual_clock_advances_both_clocks() {
        let clock = ManualClock::new(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let boot = clock.boottime_ns();
        let wall = clock.realtime_ms();
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.boottime_ns() - boot, 2_000_000_000);
        assert_eq!(clock.realtime_ms() - wall, 2_000);
    }

    #[test]
    fn test_system_boottime_is_monotonic() {
        let clock = SystemClock;
        let a = clock.boottime_ns();
        let b = clock.boottime_ns();
        assert!(b >= a);
    }
}
