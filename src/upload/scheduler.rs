//! Scheduled upload service - background task for periodic uploads.
//!
//! Two cadences share one task:
//! - an upload every hour in production (every 15 minutes in `dev`), capped
//!   at one request's worth of data
//! - a frequent calendar check that splits running timers when the local date
//!   changes, so their time lands in the right day and month buckets

use super::service::{UploadService, UploadTrigger};
use crate::clock::Clock;
use crate::error::RecorderError;
use crate::permissions::Environment;
use crate::recording::EventRecorder;
use crate::types::now_ms;
use chrono::NaiveDate;
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};

/// Configuration for the scheduled upload service.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Overrides the environment's default upload interval.
    pub upload_interval: Option<Duration>,
    /// How often to check for a new calendar day.
    pub rollover_check_interval: Duration,
    /// Whether the scheduler is enabled
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            upload_interval: None,
            rollover_check_interval: Duration::from_secs(60),
            enabled: true,
        }
    }
}

/// Default interval between uploads for an environment.
pub fn default_upload_interval(environment: Environment) -> Duration {
    match environment {
        Environment::Production => Duration::from_secs(60 * 60),
        Environment::Dev => Duration::from_secs(15 * 60),
    }
}

pub struct UploadScheduler {
    service: Arc<UploadService>,
    recorder: Arc<EventRecorder>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    /// Timestamp of the last successful upload
    last_upload_at: RwLock<Option<u64>>,
    last_seen_day: Mutex<NaiveDate>,
}

impl UploadScheduler {
    pub fn new(
        service: Arc<UploadService>,
        recorder: Arc<EventRecorder>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let today = clock.today();
        Self {
            service,
            recorder,
            clock,
            config,
            last_upload_at: RwLock::new(None),
            last_seen_day: Mutex::new(today),
        }
    }

    pub fn last_upload(&self) -> Option<u64> {
        *self.last_upload_at.read()
    }

    pub fn upload_interval(&self) -> Duration {
        self.config
            .upload_interval
            .unwrap_or_else(|| default_upload_interval(self.recorder.gate().environment()))
    }

    /// Runs indefinitely; spawn it as a tokio task.
    pub async fn start(self: Arc<Self>) {
        if !self.config.enabled {
            info!("Scheduled uploads are disabled, skipping");
            return;
        }

        let upload_every = self.upload_interval();
        info!(
            "Starting scheduled uploads with {}-second interval",
            upload_every.as_secs()
        );

        let mut upload_ticker = interval_at(Instant::now() + upload_every, upload_every);
        let rollover_every = self.config.rollover_check_interval;
        let mut rollover_ticker = interval_at(Instant::now() + rollover_every, rollover_every);

        loop {
            tokio::select! {
                _ = upload_ticker.tick() => self.do_upload().await,
                _ = rollover_ticker.tick() => {
                    self.check_rollover();
                }
            }
        }
    }

    async fn do_upload(&self) {
        match self.service.upload(UploadTrigger::Scheduled).await {
            Ok(stats) => {
                debug!(
                    "Scheduled upload completed: {} events, {} tallies in {}ms",
                    stats.events_uploaded, stats.tallies_uploaded, stats.duration_ms
                );
                *self.last_upload_at.write() = Some(now_ms());
            }
            Err(RecorderError::Disabled) | Err(RecorderError::UploadingDisabled) => {
                debug!("Scheduled upload skipped: uploading not permitted");
            }
            Err(e) => error!("Scheduled upload failed: {}", e),
        }
    }

    /// Splits running timers if the local date changed since the last check.
    /// Returns the number of timers split.
    pub fn check_rollover(&self) -> usize {
        let today = self.clock.today();
        let previous = {
            let mut last = self.last_seen_day.lock();
            if *last == today {
                return 0;
            }
            std::mem::replace(&mut *last, today)
        };

        match self.recorder.split_timers(previous) {
            Ok(count) => {
                if count > 0 {
                    info!("Date changed from {} to {}; split {} timer(s)", previous, today, count);
                }
                count
            }
            Err(RecorderError::Disabled) => 0,
            Err(e) => {
                error!("Failed to split timers at date change: {}", e);
                0
            }
        }
    }
}
