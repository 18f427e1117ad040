//! # Event Recorder Daemon Entry Point
//!
//! Parses configuration, assembles the daemon, serves the recording socket,
//! and runs the upload scheduler until SIGINT or SIGTERM. On shutdown every
//! running timer is committed and buffered events are saved for the next run.

use clap::Parser;
use log::{error, info};
use recorder::daemon::{Daemon, DaemonConfig};
use recorder::upload::UploadConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser, Debug)]
#[command(name = "event-recorder-daemon")]
#[command(about = "Records local telemetry events and uploads them to a collector", long_about = None)]
struct Args {
    /// Directory for the tally database, event cache, and send counter
    #[arg(long, env = "EVENT_RECORDER_PERSISTENT_CACHE_DIR")]
    persistent_cache_dir: PathBuf,

    /// Consent mirror file, read once at startup
    #[arg(long, env = "EVENT_RECORDER_PERMISSIONS_FILE")]
    permissions_file: PathBuf,

    /// Recording socket path
    #[arg(
        long,
        env = "EVENT_RECORDER_SOCKET",
        default_value = "/run/event-recorder/recorder.sock"
    )]
    socket_path: PathBuf,

    /// Collector base URL (defaults to the environment's collector)
    #[arg(long, env = "EVENT_RECORDER_SERVER_URL")]
    server_url: Option<String>,

    /// Seconds between scheduled uploads (defaults by environment)
    #[arg(long, env = "EVENT_RECORDER_UPLOAD_INTERVAL")]
    upload_interval: Option<u64>,

    /// Maximum bytes of events held in memory
    #[arg(long, env = "EVENT_RECORDER_MAX_BYTES_BUFFERED", default_value_t = 100_000)]
    max_bytes_buffered: usize,

    /// Maximum bytes of events kept in the pending-event cache
    #[arg(long, env = "EVENT_RECORDER_MAX_CACHE_BYTES", default_value_t = 10 * 1024 * 1024)]
    max_cache_bytes: u64,

    /// Machine id file
    #[arg(long, env = "EVENT_RECORDER_MACHINE_ID", default_value = "/etc/machine-id")]
    machine_id_path: PathBuf,

    /// Uids allowed to change consent (repeatable)
    #[arg(long = "admin-uid", env = "EVENT_RECORDER_ADMIN_UIDS", value_delimiter = ',', default_value = "0")]
    admin_uids: Vec<u32>,

    /// Upload attempts before a batch is kept for later
    #[arg(long, default_value_t = 8)]
    max_upload_attempts: u32,
}

impl Args {
    fn into_config(self) -> DaemonConfig {
        DaemonConfig {
            persistent_cache_dir: self.persistent_cache_dir,
            permissions_file: self.permissions_file,
            socket_path: self.socket_path,
            server_url: self.server_url,
            upload_interval: self.upload_interval.map(Duration::from_secs),
            max_bytes_buffered: self.max_bytes_buffered,
            max_cache_bytes: self.max_cache_bytes,
            machine_id_path: self.machine_id_path,
            admin_uids: self.admin_uids,
            upload: UploadConfig {
                max_attempts: self.max_upload_attempts.max(1),
                ..UploadConfig::default()
            },
            ..DaemonConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    info!(
        "Starting event recorder (cache dir {}, permissions {})",
        config.persistent_cache_dir.display(),
        config.permissions_file.display()
    );

    let daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            return Err(e.into());
        }
    };

    let server = daemon.bind_server()?;
    let server_task = tokio::spawn(Arc::clone(&server).run());
    let scheduler_task = tokio::spawn(daemon.scheduler().clone().start());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    scheduler_task.abort();
    let _ = scheduler_task.await;

    // Open connections commit their own timers as they close.
    server.shutdown();
    if let Err(e) = server_task.await {
        error!("Server task failed: {}", e);
    }
    drop(server);

    daemon.shutdown();
    info!("Event recorder stopped");
    Ok(())
}
