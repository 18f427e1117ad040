//! Upload pipeline.
//!
//! Builds a batch from the pending-event cache, the in-memory buffer, and the
//! closed tally buckets, then hands it to the transport with randomized
//! exponential backoff. Only one upload runs at a time. Network I/O happens
//! with no gate lock held; local cleanup afterwards re-enters the gate and is
//! skipped if consent was revoked in the meantime.

use super::batch::{SendCounter, TallyAggregate, UploadBatch};
use super::transport::Transport;
use crate::clock::Clock;
use crate::error::{RecorderError, RecorderResult};
use crate::permissions::PermissionGate;
use crate::recording::{EventRecord, UploadBuffer, MAX_REQUEST_PAYLOAD};
use crate::storage::{EventCache, TallyPeriod, TallyStore};
use crate::types::now_ms;
use log::{debug, error, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Attempts per upload before the batch is kept for later.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles for each later one.
    pub initial_backoff: Duration,
    /// Size cap for scheduler-driven uploads.
    pub scheduled_max_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_secs(1),
            scheduled_max_bytes: MAX_REQUEST_PAYLOAD,
        }
    }
}

/// What asked for the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTrigger {
    /// Periodic upload; bounded in size.
    Scheduled,
    /// Explicit `UploadEvents` call; unbounded.
    Requested,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub events_uploaded: usize,
    pub tallies_uploaded: usize,
    pub attempts: u32,
    pub duration_ms: u64,
}

pub struct UploadService {
    gate: Arc<PermissionGate>,
    tally: Arc<TallyStore>,
    buffer: Arc<UploadBuffer>,
    cache: Arc<EventCache>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    send_counter: SendCounter,
    machine_id: Uuid,
    config: UploadConfig,
    in_flight: tokio::sync::Mutex<()>,
}

impl UploadService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gate: Arc<PermissionGate>,
        tally: Arc<TallyStore>,
        buffer: Arc<UploadBuffer>,
        cache: Arc<EventCache>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        send_counter: SendCounter,
        machine_id: Uuid,
        config: UploadConfig,
    ) -> Self {
        UploadService {
            gate,
            tally,
            buffer,
            cache,
            transport,
            clock,
            send_counter,
            machine_id,
            config,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Runs one upload. Never changes consent state.
    ///
    /// # Arguments
    /// - `trigger`: `Scheduled` caps the batch at one request's worth of
    ///   data; `Requested` sends everything pending
    ///
    /// # Returns
    /// Counts of what the collector accepted. `Disabled` when metrics are
    /// off. `UploadingDisabled` when only uploading is off, after moving
    /// buffered events to the cache.
    pub async fn upload(&self, trigger: UploadTrigger) -> RecorderResult<UploadStats> {
        let _in_flight = self.in_flight.lock().await;
        let start = now_ms();

        let generation = match self.gate.check_upload() {
            Ok(generation) => generation,
            Err(RecorderError::UploadingDisabled) => {
                self.flush_buffer_to_cache()?;
                return Err(RecorderError::UploadingDisabled);
            }
            Err(e) => return Err(e),
        };

        let limit = match trigger {
            UploadTrigger::Scheduled => Some(self.config.scheduled_max_bytes),
            UploadTrigger::Requested => None,
        };

        // Gather under the gate so a concurrent purge cannot interleave.
        let (cached, buffered, rows) = self.gate.with_generation(generation, || {
            let cached = self
                .cache
                .load::<EventRecord>(limit)
                .map_err(RecorderError::Storage)?;
            let cached_bytes: usize = cached.iter().map(|c| c.cost).sum();
            let buffered = self
                .buffer
                .take(limit.map(|l| l.saturating_sub(cached_bytes)));

            let today = self.clock.today();
            let mut rows = self
                .tally
                .rows_before(TallyPeriod::Day, today)
                .map_err(RecorderError::Storage)?;
            rows.extend(
                self.tally
                    .rows_before(TallyPeriod::Month, today)
                    .map_err(RecorderError::Storage)?,
            );
            Ok((cached, buffered, rows))
        })?;

        let cached_ids: Vec<i64> = cached.iter().map(|c| c.id).collect();
        let mut batch = UploadBatch::new(
            self.machine_id,
            cached
                .into_iter()
                .map(|c| c.record)
                .chain(buffered.iter().cloned()),
            rows.iter().map(TallyAggregate::from).collect(),
        );

        if batch.is_empty() {
            debug!("Nothing to upload");
            return Ok(UploadStats {
                duration_ms: now_ms() - start,
                ..UploadStats::default()
            });
        }

        match self.send_with_retries(&mut batch, generation).await {
            Ok(attempts) => {
                let cleanup = self.gate.with_generation(generation, || {
                    self.cache
                        .remove(&cached_ids)
                        .map_err(RecorderError::Storage)?;
                    self.tally.settle(&rows).map_err(RecorderError::Storage)
                });
                match cleanup {
                    Ok(()) => {}
                    Err(RecorderError::Disabled) => {
                        info!("Metrics were disabled during upload; local data already purged")
                    }
                    Err(e) => error!("Upload succeeded but cleanup failed: {}", e),
                }

                let stats = UploadStats {
                    events_uploaded: batch.singulars.len()
                        + batch.aggregates.len()
                        + batch.sequences.len(),
                    tallies_uploaded: batch.tallies.len(),
                    attempts,
                    duration_ms: now_ms() - start,
                };
                info!(
                    "Uploaded {} event(s) and {} tally aggregate(s) in {} attempt(s)",
                    stats.events_uploaded, stats.tallies_uploaded, stats.attempts
                );
                Ok(stats)
            }
            Err(e) => {
                let kept = self
                    .gate
                    .with_generation(generation, || {
                        self.cache.store(&buffered).map_err(RecorderError::Storage)
                    });
                match kept {
                    Ok(n) => warn!("Upload failed, kept {} buffered event(s) for later: {}", n, e),
                    Err(RecorderError::Disabled) => {}
                    Err(store_err) => error!(
                        "Upload failed and buffered events could not be cached: {}",
                        store_err
                    ),
                }
                Err(RecorderError::Upload(e))
            }
        }
    }

    async fn send_with_retries(&self, batch: &mut UploadBatch, generation: u64) -> Result<u32, String> {
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.config.max_attempts {
            if self.gate.generation() != generation {
                return Err("metrics were disabled during upload".to_string());
            }

            let send_number = self.send_counter.next().unwrap_or_else(|e| {
                warn!("Could not update send counter: {}", e);
                0
            });
            batch.stamp(send_number, &*self.clock);
            let body = batch.encode()?;

            match self.transport.send(Uuid::new_v4(), body).await {
                Ok(()) => return Ok(attempt),
                Err(e) => {
                    warn!(
                        "Upload attempt {}/{} failed: {}",
                        attempt, self.config.max_attempts, e
                    );
                    last_error = e;
                }
            }

            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(format!(
            "gave up after {} attempts: {}",
            self.config.max_attempts, last_error
        ))
    }

    /// `initial * 2^(attempt - 1) * U[1, 2)`.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .initial_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let factor: f64 = rand::thread_rng().gen_range(1.0..2.0);
        base.mul_f64(factor)
    }

    /// Moves every buffered record to the pending-event cache.
    pub fn flush_buffer_to_cache(&self) -> RecorderResult<usize> {
        let result = self.gate.with_enabled(|| {
            let records = self.buffer.take(None);
            if records.is_empty() {
                return Ok(0);
            }
            self.cache.store(&records).map_err(RecorderError::Storage)
        });
        match result {
            Err(RecorderError::Disabled) => Ok(0),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_config_defaults() {
        let config = UploadConfig::default();
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.scheduled_max_bytes, 100_000);
    }
}
