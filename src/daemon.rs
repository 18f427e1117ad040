//! # Daemon Assembly
//!
//! Wires the recorder's components together and owns their lifecycle.
//!
//! Lock order across components is always gate → timer registry → tally
//! store. The consent listener installed here runs under the gate's write
//! lock and purges timers, tallies, the upload buffer, and the event cache.

use crate::clock::{Clock, SystemClock};
use crate::error::RecorderError;
use crate::permissions::{
    Authorizer, ConsentListener, Environment, PermissionGate, PermissionState, UidAuthorizer,
};
use crate::protocol::RecorderServer;
use crate::recording::{EventRecorder, TimerRegistry, UploadBuffer, DEFAULT_MAX_BYTES_BUFFERED};
use crate::storage::{
    EventCache, TallyStore, DEFAULT_MAX_CACHE_BYTES, EVENT_CACHE_DB_NAME, TALLY_DB_NAME,
};
use crate::upload::{
    read_machine_id, HttpTransport, SchedulerConfig, SendCounter, Transport, UploadConfig,
    UploadScheduler, UploadService, DEFAULT_MACHINE_ID_PATH, NETWORK_SEND_FILE_NAME,
};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ================================================================================================
// CONFIGURATION
// ================================================================================================

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Directory holding the tally database, event cache, and send counter.
    pub persistent_cache_dir: PathBuf,
    /// Consent mirror file, read once at startup.
    pub permissions_file: PathBuf,
    pub socket_path: PathBuf,
    /// Collector base URL. Derived from the environment when unset.
    pub server_url: Option<String>,
    /// Overrides the environment's upload interval.
    pub upload_interval: Option<Duration>,
    pub max_bytes_buffered: usize,
    pub max_cache_bytes: u64,
    pub machine_id_path: PathBuf,
    /// Uids allowed to change consent.
    pub admin_uids: Vec<u32>,
    pub http_timeout: Duration,
    pub upload: UploadConfig,
    pub scheduler_enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            persistent_cache_dir: PathBuf::from("/var/cache/event-recorder"),
            permissions_file: PathBuf::from("/etc/event-recorder/permissions.conf"),
            socket_path: PathBuf::from("/run/event-recorder/recorder.sock"),
            server_url: None,
            upload_interval: None,
            max_bytes_buffered: DEFAULT_MAX_BYTES_BUFFERED,
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            machine_id_path: PathBuf::from(DEFAULT_MACHINE_ID_PATH),
            admin_uids: vec![0],
            http_timeout: Duration::from_secs(30),
            upload: UploadConfig::default(),
            scheduler_enabled: true,
        }
    }
}

impl DaemonConfig {
    /// Default config rooted in a single directory; handy for tests.
    pub fn in_dir(dir: &std::path::Path) -> Self {
        Self {
            persistent_cache_dir: dir.join("cache"),
            permissions_file: dir.join("permissions.conf"),
            socket_path: dir.join("recorder.sock"),
            machine_id_path: dir.join("machine-id"),
            ..Self::default()
        }
    }
}

/// Collector URL for an environment.
pub fn default_server_url(environment: Environment) -> String {
    format!("https://{}.metrics.endlessm.com", environment)
}

// ================================================================================================
// DAEMON
// ================================================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub enabled: bool,
    pub uploading_enabled: bool,
    pub running_timers: usize,
    pub buffered_events: usize,
    pub buffered_bytes: usize,
    pub cached_events: usize,
    pub tally_rows: usize,
}

pub struct Daemon {
    config: DaemonConfig,
    gate: Arc<PermissionGate>,
    timers: Arc<TimerRegistry>,
    tally: Arc<TallyStore>,
    cache: Arc<EventCache>,
    buffer: Arc<UploadBuffer>,
    recorder: Arc<EventRecorder>,
    uploader: Arc<UploadService>,
    scheduler: Arc<UploadScheduler>,
}

impl Daemon {
    /// Production assembly: host clocks, HTTP transport, uid allow-list.
    pub fn new(config: DaemonConfig) -> Result<Self, String> {
        let initial = PermissionState::load(&config.permissions_file);
        let server_url = config
            .server_url
            .clone()
            .unwrap_or_else(|| default_server_url(initial.environment));
        info!("Uploading to {}", server_url);

        let transport = Arc::new(HttpTransport::new(&server_url, config.http_timeout)?);
        let authorizer = Box::new(UidAuthorizer::new(config.admin_uids.iter().copied()));
        Self::assemble(config, initial, Arc::new(SystemClock), transport, authorizer)
    }

    /// Assembly with injected clock, transport, and authorizer.
    ///
    /// # Arguments
    /// - `config`: Paths and limits; `permissions_file` is read here once
    /// - `clock`: Boot clock and calendar source for every component
    /// - `transport`: Where upload batches are sent
    /// - `authorizer`: Decides who may change consent
    ///
    /// # Returns
    /// The assembled daemon with its purge listener installed, or an error
    /// if a store cannot be opened.
    ///
    /// # Example
    /// ```rust,ignore
    /// let daemon = Daemon::with_parts(
    ///     DaemonConfig::in_dir(dir.path()),
    ///     Arc::new(ManualClock::new(today)),
    ///     Arc::new(MemoryTransport::new()),
    ///     Box::new(UidAuthorizer::new([0])),
    /// )?;
    /// ```
    pub fn with_parts(
        config: DaemonConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        authorizer: Box<dyn Authorizer>,
    ) -> Result<Self, String> {
        let initial = PermissionState::load(&config.permissions_file);
        Self::assemble(config, initial, clock, transport, authorizer)
    }

    fn assemble(
        config: DaemonConfig,
        initial: PermissionState,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        authorizer: Box<dyn Authorizer>,
    ) -> Result<Self, String> {
        std::fs::create_dir_all(&config.persistent_cache_dir)
            .map_err(|e| format!("Failed to create persistent cache directory: {}", e))?;

        let gate = Arc::new(PermissionGate::open(
            &config.permissions_file,
            initial,
            authorizer,
        )?);
        let tally = Arc::new(TallyStore::open(
            config.persistent_cache_dir.join(TALLY_DB_NAME),
        )?);
        let cache = Arc::new(EventCache::open(
            config.persistent_cache_dir.join(EVENT_CACHE_DB_NAME),
            config.max_cache_bytes,
        )?);
        let buffer = Arc::new(UploadBuffer::new(config.max_bytes_buffered));
        let timers = Arc::new(TimerRegistry::new(Arc::clone(&clock)));

        gate.add_listener(purge_listener(
            Arc::clone(&timers),
            Arc::clone(&tally),
            Arc::clone(&buffer),
            Arc::clone(&cache),
        ));

        // Consent may have been revoked while the daemon was down.
        if !gate.enabled() {
            purge_stale_data(&tally, &cache);
        }

        let recorder = Arc::new(EventRecorder::new(
            Arc::clone(&gate),
            Arc::clone(&timers),
            Arc::clone(&tally),
            Arc::clone(&buffer),
            Arc::clone(&clock),
        ));

        let uploader = Arc::new(UploadService::new(
            Arc::clone(&gate),
            Arc::clone(&tally),
            Arc::clone(&buffer),
            Arc::clone(&cache),
            transport,
            Arc::clone(&clock),
            SendCounter::new(config.persistent_cache_dir.join(NETWORK_SEND_FILE_NAME)),
            read_machine_id(&config.machine_id_path),
            config.upload.clone(),
        ));

        let scheduler = Arc::new(UploadScheduler::new(
            Arc::clone(&uploader),
            Arc::clone(&recorder),
            clock,
            SchedulerConfig {
                upload_interval: config.upload_interval,
                enabled: config.scheduler_enabled,
                ..SchedulerConfig::default()
            },
        ));

        Ok(Daemon {
            config,
            gate,
            timers,
            tally,
            cache,
            buffer,
            recorder,
            uploader,
            scheduler,
        })
    }

    // ============================================================================================
    // ACCESSORS
    // ============================================================================================

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn recorder(&self) -> &Arc<EventRecorder> {
        &self.recorder
    }

    pub fn uploader(&self) -> &Arc<UploadService> {
        &self.uploader
    }

    pub fn scheduler(&self) -> &Arc<UploadScheduler> {
        &self.scheduler
    }

    pub fn tally(&self) -> &Arc<TallyStore> {
        &self.tally
    }

    pub fn cache(&self) -> &Arc<EventCache> {
        &self.cache
    }

    pub fn stats(&self) -> DaemonStats {
        let state = self.gate.state();
        DaemonStats {
            enabled: state.enabled,
            uploading_enabled: state.upload_allowed(),
            running_timers: self.timers.len(),
            buffered_events: self.buffer.len(),
            buffered_bytes: self.buffer.bytes(),
            cached_events: self.cache.len().unwrap_or(0),
            tally_rows: self.tally.row_count().unwrap_or(0),
        }
    }

    // ============================================================================================
    // LIFECYCLE
    // ============================================================================================

    pub fn bind_server(&self) -> Result<Arc<RecorderServer>, String> {
        RecorderServer::bind(
            &self.config.socket_path,
            Arc::clone(&self.recorder),
            Arc::clone(&self.uploader),
        )
        .map(Arc::new)
    }

    /// Commits every running timer and moves buffered events to the cache.
    pub fn shutdown(&self) {
        match self.recorder.commit_all_timers() {
            Ok(0) => {}
            Ok(n) => info!("Committed {} running timer(s) at shutdown", n),
            Err(RecorderError::Disabled) => {}
            Err(e) => error!("Failed to commit timers at shutdown: {}", e),
        }
        match self.uploader.flush_buffer_to_cache() {
            Ok(0) => {}
            Ok(n) => info!("Saved {} buffered event(s) for the next run", n),
            Err(e) => error!("Failed to flush buffered events at shutdown: {}", e),
        }
        self.gate.shutdown();
    }
}

fn purge_listener(
    timers: Arc<TimerRegistry>,
    tally: Arc<TallyStore>,
    buffer: Arc<UploadBuffer>,
    cache: Arc<EventCache>,
) -> ConsentListener {
    Box::new(move |state| {
        if state.enabled {
            return;
        }
        let dropped = timers.purge();
        buffer.clear();
        purge_stale_data(&tally, &cache);
        info!(
            "Metrics disabled: discarded {} running timer(s) and all pending data",
            dropped
        );
    })
}

fn purge_stale_data(tally: &TallyStore, cache: &EventCache) {
    if let Err(e) = tally.clear_all() {
        error!("Failed to clear tally store: {}", e);
    }
    if let Err(e) = cache.clear() {
        error!("Failed to clear event cache: {}", e);
    }
}
