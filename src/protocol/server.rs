//! Unix socket server for the recording protocol.
//!
//! One task per connection; requests on a connection are handled strictly in
//! order and each receives exactly one response. The caller's uid and pid are
//! taken from the socket's peer credentials. When a connection ends, every
//! timer it still owns is committed.
//!
//! `shutdown` stops the accept loop and closes every open connection; `run`
//! returns only after each connection has committed its timers.

use super::framing::{read_message, write_message, FrameError};
use super::messages::{Request, Response};
use crate::error::{ErrorReply, RecorderError, RecorderResult};
use crate::permissions::ClientCredentials;
use crate::recording::{ClientSession, EventRecorder};
use crate::types::{payload_from_parts, ClientId, StatisticsFlags};
use crate::upload::{UploadService, UploadTrigger};
use log::{debug, error, info, warn};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Any local user may connect; privileged calls are checked per request.
const SOCKET_MODE: u32 = 0o666;

pub struct RecorderServer {
    socket_path: PathBuf,
    listener: UnixListener,
    recorder: Arc<EventRecorder>,
    uploader: Arc<UploadService>,
    next_client: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl RecorderServer {
    /// Binds the socket, replacing a stale one left by an earlier run.
    pub fn bind(
        socket_path: &Path,
        recorder: Arc<EventRecorder>,
        uploader: Arc<UploadService>,
    ) -> Result<Self, String> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create socket directory: {}", e))?;
        }
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .map_err(|e| format!("Failed to remove stale socket: {}", e))?;
        }

        let listener = UnixListener::bind(socket_path)
            .map_err(|e| format!("Failed to bind {}: {}", socket_path.display(), e))?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(|e| format!("Failed to set socket permissions: {}", e))?;

        info!("Listening on {}", socket_path.display());
        Ok(RecorderServer {
            socket_path: socket_path.to_path_buf(),
            listener,
            recorder,
            uploader,
            next_client: AtomicU64::new(1),
            shutdown: watch::channel(false).0,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Asks `run` to stop accepting and to close every open connection.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Accepts connections until `shutdown` is called, then waits for every
    /// connection task to finish.
    pub async fn run(self: Arc<Self>) {
        let mut stop = self.shutdown.subscribe();
        let mut connections = JoinSet::new();

        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        connections.spawn(async move {
                            server.handle_connection(stream).await;
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = stop.changed() => {}
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!("Closing {} open connection(s)", connections.len());
        while let Some(result) = connections.join_next().await {
            if let Err(e) = result {
                error!("Connection task failed: {}", e);
            }
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) {
        let credentials = match stream.peer_cred() {
            Ok(cred) => ClientCredentials {
                uid: cred.uid(),
                pid: cred.pid(),
            },
            Err(e) => {
                warn!("Rejecting connection without peer credentials: {}", e);
                return;
            }
        };

        let client_id = ClientId(self.next_client.fetch_add(1, Ordering::SeqCst));
        let mut session = ClientSession::new(client_id, credentials);
        debug!(
            "{} connected (uid {}, pid {:?})",
            client_id, credentials.uid, credentials.pid
        );

        let mut stop = self.shutdown.subscribe();
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            let message = tokio::select! {
                message = read_message::<_, Request>(&mut stream) => message,
                _ = stop.changed() => continue,
            };
            let response = match message {
                Ok(Some(request)) => {
                    debug!("{} -> {}", client_id, request.name());
                    self.dispatch(&mut session, request).await
                }
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    warn!("{} sent a bad message: {}", client_id, e);
                    error_response(RecorderError::Protocol(e.to_string()))
                }
                Err(FrameError::Io(e)) => {
                    debug!("{} connection error: {}", client_id, e);
                    break;
                }
                Err(e) => {
                    warn!("{} dropped: {}", client_id, e);
                    break;
                }
            };

            if let Err(e) = write_message(&mut stream, &response).await {
                debug!("{} could not receive response: {}", client_id, e);
                break;
            }
        }

        self.recorder.disconnect(&session);
        debug!("{} disconnected", client_id);
    }

    /// Executes one request on behalf of `session`.
    pub async fn dispatch(&self, session: &mut ClientSession, request: Request) -> Response {
        match self.execute(session, request).await {
            Ok(response) => response,
            Err(e) => error_response(e),
        }
    }

    async fn execute(&self, session: &mut ClientSession, request: Request) -> RecorderResult<Response> {
        let gate = self.recorder.gate();
        match request {
            Request::RecordSingularEvent {
                unix_user_id,
                event_id,
                relative_timestamp,
                has_payload,
                payload,
            } => self
                .recorder
                .record_singular(
                    session,
                    unix_user_id,
                    &event_id,
                    relative_timestamp,
                    payload_from_parts(has_payload, payload),
                )
                .map(|_| Response::Ok),

            Request::RecordAggregateEvent {
                unix_user_id,
                event_id,
                num_events,
                relative_timestamp,
                has_payload,
                payload,
            } => self
                .recorder
                .record_aggregate(
                    session,
                    unix_user_id,
                    &event_id,
                    num_events,
                    relative_timestamp,
                    payload_from_parts(has_payload, payload),
                )
                .map(|_| Response::Ok),

            Request::RecordEventSequence {
                unix_user_id,
                event_id,
                events,
            } => {
                let points = events
                    .into_iter()
                    .map(|e| (e.relative_timestamp, payload_from_parts(e.has_payload, e.payload)))
                    .collect();
                self.recorder
                    .record_sequence(session, unix_user_id, &event_id, points)
                    .map(|_| Response::Ok)
            }

            Request::StartAggregateTimer {
                statistics_flags,
                event_id,
                has_payload,
                payload,
            } => self
                .recorder
                .start_timer(
                    session,
                    StatisticsFlags(statistics_flags),
                    &event_id,
                    payload_from_parts(has_payload, payload),
                )
                .map(|handle| Response::Timer { handle }),

            Request::StopTimer { handle } => self
                .recorder
                .stop_timer(session, handle)
                .map(|_| Response::Ok),

            Request::UploadEvents => self
                .uploader
                .upload(UploadTrigger::Requested)
                .await
                .map(|stats| Response::Uploaded {
                    events: stats.events_uploaded as u64,
                    tallies: stats.tallies_uploaded as u64,
                }),

            Request::GetEnabled => Ok(Response::Enabled(gate.enabled())),

            Request::SetEnabled { enabled } => gate
                .set_enabled(&session.credentials, enabled)
                .map(|_| Response::Ok),

            Request::GetUploadingEnabled => Ok(Response::Enabled(gate.uploading_enabled())),

            Request::SetUploadingEnabled { enabled } => gate
                .set_uploading_enabled(&session.credentials, enabled)
                .map(|_| Response::Ok),
        }
    }
}

fn error_response(err: RecorderError) -> Response {
    Response::Error(ErrorReply::from(&err))
}

impl Drop for RecorderServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("Could not remove socket {}: {}", self.socket_path.display(), e);
        }
    }
}
