//! # Permission Gate
//!
//! Single authoritative consent state shared by every recording path.
//!
//! Recording operations run their side effects inside [`PermissionGate::with_enabled`],
//! which holds the gate's read lock. A consent transition takes the write lock,
//! so a revocation can never interleave with a half-finished record or commit.
//! Listeners registered with [`PermissionGate::add_listener`] run while the write
//! lock is held and must not call back into the gate.
//!
//! The state is mirrored to a key file by a dedicated writer thread. The file is
//! read once at startup; runtime changes never read it back.

use crate::error::{RecorderError, RecorderResult};
use crate::keyfile::KeyFile;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

const GLOBAL_GROUP: &str = "global";
const ENABLED_KEY: &str = "enabled";
const UPLOADING_ENABLED_KEY: &str = "uploading_enabled";
const ENVIRONMENT_KEY: &str = "environment";

// ================================================================================================
// STATE
// ================================================================================================

/// Deployment environment; selects the upload interval and collector host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Production,
    Dev,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Dev => "dev",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "production" => Some(Environment::Production),
            "dev" => Some(Environment::Dev),
            _ => None,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consent flags plus the environment they were configured for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PermissionState {
    pub enabled: bool,
    /// Stored flag. Only effective while `enabled` is true.
    pub uploading_enabled: bool,
    pub environment: Environment,
}

impl PermissionState {
    pub fn from_keyfile(file: &KeyFile) -> Self {
        let enabled = read_flag(file, ENABLED_KEY);
        let uploading_enabled = read_flag(file, UPLOADING_ENABLED_KEY);
        let environment = match file.get(GLOBAL_GROUP, ENVIRONMENT_KEY) {
            None => Environment::default(),
            Some(text) => Environment::parse(text).unwrap_or_else(|| {
                warn!(
                    "Unknown environment '{}' in permissions file, using production",
                    text
                );
                Environment::Production
            }),
        };

        PermissionState {
            enabled,
            uploading_enabled,
            environment,
        }
    }

    pub fn to_keyfile(&self) -> KeyFile {
        let mut file = KeyFile::new();
        file.set(GLOBAL_GROUP, ENABLED_KEY, self.enabled);
        file.set(GLOBAL_GROUP, UPLOADING_ENABLED_KEY, self.uploading_enabled);
        file.set(GLOBAL_GROUP, ENVIRONMENT_KEY, self.environment);
        file
    }

    /// Reads the startup state. A missing or unreadable file yields the
    /// disabled, production fallback.
    pub fn load(path: &Path) -> Self {
        match KeyFile::load(path) {
            Ok(Some(file)) => Self::from_keyfile(&file),
            Ok(None) => {
                info!(
                    "Permissions file {} not found, metrics start disabled",
                    path.display()
                );
                Self::default()
            }
            Err(e) => {
                warn!("Could not load permissions file: {}", e);
                Self::default()
            }
        }
    }

    /// Whether uploads are currently allowed.
    pub fn upload_allowed(&self) -> bool {
        self.enabled && self.uploading_enabled
    }
}

fn read_flag(file: &KeyFile, key: &str) -> bool {
    file.get_bool(GLOBAL_GROUP, key).unwrap_or_else(|e| {
        warn!("{}, treating as false", e);
        None
    })
    .unwrap_or(false)
}

// ================================================================================================
// AUTHORIZATION
// ================================================================================================

/// Kernel-reported identity of the peer on a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientCredentials {
    pub uid: u32,
    pub pid: Option<i32>,
}

/// Calls that change consent and therefore need approval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrivilegedAction {
    SetEnabled,
    SetUploadingEnabled,
}

impl PrivilegedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivilegedAction::SetEnabled => "set metrics enabled",
            PrivilegedAction::SetUploadingEnabled => "set uploading enabled",
        }
    }
}

/// Backend that approves privileged calls.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, caller: &ClientCredentials, action: PrivilegedAction) -> bool;
}

/// Approves callers whose uid is in a fixed set. Root by default.
#[derive(Debug, Clone)]
pub struct UidAuthorizer {
    allowed: HashSet<u32>,
}

impl UidAuthorizer {
    pub fn new(allowed: impl IntoIterator<Item = u32>) -> Self {
        UidAuthorizer {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl Default for UidAuthorizer {
    fn default() -> Self {
        Self::new([0])
    }
}

impl Authorizer for UidAuthorizer {
    fn authorize(&self, caller: &ClientCredentials, action: PrivilegedAction) -> bool {
        let allowed = self.allowed.contains(&caller.uid);
        if !allowed {
            debug!(
                "Denied '{}' for uid {} (pid {:?})",
                action.as_str(),
                caller.uid,
                caller.pid
            );
        }
        allowed
    }
}

// ================================================================================================
// MIRROR WRITER
// ================================================================================================

enum MirrorCommand {
    Write(PermissionState),
    Sync(mpsc::Sender<()>),
}

/// Asynchronous, ordered writer of the consent mirror file.
pub struct ConsentMirror {
    path: PathBuf,
    tx: Mutex<Option<mpsc::Sender<MirrorCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConsentMirror {
    pub fn spawn(path: PathBuf) -> Result<Self, String> {
        let (tx, rx) = mpsc::channel::<MirrorCommand>();
        let thread_path = path.clone();

        let worker = thread::Builder::new()
            .name("consent-mirror".to_string())
            .spawn(move || {
                for command in rx {
                    match command {
                        MirrorCommand::Write(state) => {
                            match state.to_keyfile().save_atomic(&thread_path) {
                                Ok(()) => debug!("Mirrored consent state {:?}", state),
                                Err(e) => error!(
                                    "Failed to write permissions file {}: {}",
                                    thread_path.display(),
                                    e
                                ),
                            }
                        }
                        MirrorCommand::Sync(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .map_err(|e| format!("Failed to spawn consent mirror thread: {}", e))?;

        Ok(ConsentMirror {
            path,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queues a write. Never blocks on disk I/O.
    pub fn submit(&self, state: PermissionState) {
        if let Some(tx) = self.tx.lock().as_ref() {
            if tx.send(MirrorCommand::Write(state)).is_err() {
                warn!("Consent mirror writer has stopped; state not persisted");
            }
        }
    }

    /// Blocks until every write queued so far has been attempted.
    pub fn sync(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(MirrorCommand::Sync(ack_tx)).is_ok(),
            None => false,
        };
        if sent {
            let _ = ack_rx.recv();
        }
    }

    /// Drains outstanding writes and stops the writer thread.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Consent mirror writer panicked");
            }
        }
    }
}

impl Drop for ConsentMirror {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ================================================================================================
// GATE
// ================================================================================================

/// Callback run under the gate's write lock after every transition of `enabled`.
pub type ConsentListener = Box<dyn Fn(&PermissionState) + Send + Sync>;

pub struct PermissionGate {
    state: RwLock<PermissionState>,
    /// Bumped on every revocation; lets long-running work detect it.
    generation: AtomicU64,
    listeners: Mutex<Vec<ConsentListener>>,
    mirror: ConsentMirror,
    authorizer: Box<dyn Authorizer>,
}

impl PermissionGate {
    pub fn new(
        initial: PermissionState,
        mirror: ConsentMirror,
        authorizer: Box<dyn Authorizer>,
    ) -> Self {
        PermissionGate {
            state: RwLock::new(initial),
            generation: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            mirror,
            authorizer,
        }
    }

    /// Starts from `initial`, already loaded from `path` by the caller, and
    /// mirrors every later change back to `path`.
    pub fn open(
        path: &Path,
        initial: PermissionState,
        authorizer: Box<dyn Authorizer>,
    ) -> Result<Self, String> {
        info!(
            "Metrics {} (uploading {}, environment {})",
            if initial.enabled { "enabled" } else { "disabled" },
            if initial.upload_allowed() { "enabled" } else { "disabled" },
            initial.environment
        );
        let mirror = ConsentMirror::spawn(path.to_path_buf())?;
        Ok(Self::new(initial, mirror, authorizer))
    }

    pub fn add_listener(&self, listener: ConsentListener) {
        self.listeners.lock().push(listener);
    }

    pub fn state(&self) -> PermissionState {
        *self.state.read()
    }

    pub fn enabled(&self) -> bool {
        self.state.read().enabled
    }

    /// Effective uploading flag.
    pub fn uploading_enabled(&self) -> bool {
        self.state.read().upload_allowed()
    }

    pub fn environment(&self) -> Environment {
        self.state.read().environment
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Runs `f` with the read lock held, or fails with `Disabled`.
    ///
    /// `f` must not call any other gate method that takes the lock.
    pub fn with_enabled<R>(&self, f: impl FnOnce() -> RecorderResult<R>) -> RecorderResult<R> {
        let state = self.state.read();
        if !state.enabled {
            return Err(RecorderError::Disabled);
        }
        f()
    }

    /// Checks that an upload may start. Returns the current generation.
    pub fn check_upload(&self) -> RecorderResult<u64> {
        let state = self.state.read();
        if !state.enabled {
            return Err(RecorderError::Disabled);
        }
        if !state.uploading_enabled {
            return Err(RecorderError::UploadingDisabled);
        }
        Ok(self.generation())
    }

    /// Like [`with_enabled`](Self::with_enabled), but also fails when the
    /// gate has been revoked since `generation` was observed.
    pub fn with_generation<R>(
        &self,
        generation: u64,
        f: impl FnOnce() -> RecorderResult<R>,
    ) -> RecorderResult<R> {
        let state = self.state.read();
        if !state.enabled || self.generation() != generation {
            return Err(RecorderError::Disabled);
        }
        f()
    }

    fn authorize(&self, caller: &ClientCredentials, action: PrivilegedAction) -> RecorderResult<()> {
        if self.authorizer.authorize(caller, action) {
            Ok(())
        } else {
            Err(RecorderError::Unauthorized {
                action: action.as_str().to_string(),
            })
        }
    }

    /// Privileged consent change. A transition clears `uploading_enabled`.
    pub fn set_enabled(&self, caller: &ClientCredentials, enabled: bool) -> RecorderResult<()> {
        self.authorize(caller, PrivilegedAction::SetEnabled)?;

        let mut state = self.state.write();
        if state.enabled == enabled {
            return Ok(());
        }

        state.enabled = enabled;
        state.uploading_enabled = false;
        if !enabled {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        info!("Metrics {}", if enabled { "enabled" } else { "disabled" });

        for listener in self.listeners.lock().iter() {
            listener(&state);
        }
        self.mirror.submit(*state);
        Ok(())
    }

    /// Privileged change of the uploading flag. Fails with `Disabled` while
    /// metrics are off.
    pub fn set_uploading_enabled(
        &self,
        caller: &ClientCredentials,
        uploading_enabled: bool,
    ) -> RecorderResult<()> {
        self.authorize(caller, PrivilegedAction::SetUploadingEnabled)?;

        let mut state = self.state.write();
        if !state.enabled {
            return Err(RecorderError::Disabled);
        }
        if state.uploading_enabled == uploading_enabled {
            return Ok(());
        }

        state.uploading_enabled = uploading_enabled;
        info!(
            "Uploading {}",
            if uploading_enabled { "enabled" } else { "disabled" }
        );
        self.mirror.submit(*state);
        Ok(())
    }

    /// Waits for queued mirror writes.
    pub fn sync_mirror(&self) {
        self.mirror.sync();
    }

    pub fn shutdown(&self) {
        self.mirror.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    const ROOT: ClientCredentials = ClientCredentials {
        uid: 0,
        pid: Some(1),
    };
    const USER: ClientCredentials = ClientCredentials {
        uid: 1000,
        pid: Some(4242),
    };

    fn open_gate(dir: &Path, contents: Option<&str>) -> (PermissionGate, PathBuf) {
        let path = dir.join("permissions.conf");
        if let Some(text) = contents {
            std::fs::write(&path, text).unwrap();
        }
        let initial = PermissionState::load(&path);
        let gate = PermissionGate::open(&path, initial, Box::new(UidAuthorizer::default())).unwrap();
        (gate, path)
    }

    #[test]
    fn test_missing_file_starts_disabled() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (gate, _) = open_gate(tmp_dir.path(), None);
        assert!(!gate.enabled());
        assert!(!gate.uploading_enabled());
        assert_eq!(gate.environment(), Environment::Production);
    }

    #[test]
    fn test_reads_startup_state() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (gate, _) = open_gate(
            tmp_dir.path(),
            Some("[global]\nenabled=true\nuploading_enabled=true\nenvironment=dev\n"),
        );
        assert!(gate.enabled());
        assert!(gate.uploading_enabled());
        assert_eq!(gate.environment(), Environment::Dev);
    }

    #[test]
    fn test_unauthorized_leaves_state_unchanged() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (gate, _) = open_gate(tmp_dir.path(), Some("[global]\nenabled=true\n"));

        let err = gate.set_enabled(&USER, false).unwrap_err();
        assert!(matches!(err, RecorderError::Unauthorized { .. }));
        assert!(gate.enabled());
    }

    #[test]
    fn test_transition_clears_uploading_and_mirrors() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (gate, path) = open_gate(
            tmp_dir.path(),
            Some("[global]\nenabled=true\nuploading_enabled=true\n"),
        );

        gate.set_enabled(&ROOT, false).unwrap();
        assert!(!gate.uploading_enabled());
        gate.set_enabled(&ROOT, true).unwrap();
        assert!(gate.enabled());
        assert!(!gate.uploading_enabled());

        gate.sync_mirror();
        let mirrored = PermissionState::load(&path);
        assert!(mirrored.enabled);
        assert!(!mirrored.uploading_enabled);
    }

    #[test]
    fn test_uploading_requires_enabled() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (gate, _) = open_gate(tmp_dir.path(), None);

        assert_eq!(
            gate.set_uploading_enabled(&ROOT, true),
            Err(RecorderError::Disabled)
        );
        gate.set_enabled(&ROOT, true).unwrap();
        gate.set_uploading_enabled(&ROOT, true).unwrap();
        assert!(gate.uploading_enabled());
        assert_eq!(gate.check_upload(), Ok(gate.generation()));
    }

    #[test]
    fn test_listener_runs_on_revocation_and_bumps_generation() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (gate, _) = open_gate(tmp_dir.path(), Some("[global]\nenabled=true\n"));

        let revocations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&revocations);
        gate.add_listener(Box::new(move |state| {
            if !state.enabled {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let before = gate.generation();
        gate.set_enabled(&ROOT, false).unwrap();
        // Idempotent set does not notify.
        gate.set_enabled(&ROOT, false).unwrap();

        assert_eq!(revocations.load(Ordering::SeqCst), 1);
        assert_eq!(gate.generation(), before + 1);
        assert_eq!(
            gate.with_generation(before, || Ok(())),
            Err(RecorderError::Disabled)
        );
        assert_eq!(gate.with_enabled(|| Ok(())), Err(RecorderError::Disabled));
    }

    #[test]
    fn test_mirror_failure_is_not_fatal() {
        let tmp_dir = tempfile::tempdir().unwrap();
        // Parent is a regular file, so the write must fail.
        let blocker = tmp_dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let path = blocker.join("permissions.conf");

        let gate = PermissionGate::open(
            &path,
            PermissionState::default(),
            Box::new(UidAuthorizer::default()),
        )
        .unwrap();
        gate.set_enabled(&ROOT, true).unwrap();
        gate.sync_mirror();
        assert!(gate.enabled());
    }

    #[test]
    fn test_open_starts_from_given_state() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("permissions.conf");
        std::fs::write(&path, "[global]\nenabled=false\n").unwrap();

        let loaded = PermissionState {
            enabled: true,
            uploading_enabled: true,
            environment: Environment::Dev,
        };
        let gate = PermissionGate::open(&path, loaded, Box::new(UidAuthorizer::default())).unwrap();
        assert_eq!(gate.state(), loaded);

        // The file is only written on a change.
        gate.sync_mirror();
        assert!(!PermissionState::load(&path).enabled);
    }
}
