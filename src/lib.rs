//! # Event Recorder
//!
//! Privileged telemetry recording daemon. Local clients record singular,
//! aggregate, and sequence events over a Unix socket; aggregate timers are
//! folded into durable per-day and per-month tallies; everything is gated by
//! a consent setting and periodically uploaded to a remote collector.
//!
//! ```text
//! client ──► protocol::server ──► permissions::PermissionGate
//!                                      │
//!                     ┌────────────────┴────────────────┐
//!                     ▼                                 ▼
//!            recording::UploadBuffer          recording::TimerRegistry
//!                     │                                 │
//!                     ▼                                 ▼
//!            upload::UploadService ◄──────────  storage::TallyStore
//! ```

pub mod clock;
pub mod daemon;
pub mod error;
pub mod keyfile;
pub mod permissions;
pub mod protocol;
pub mod recording;
pub mod storage;
pub mod types;
pub mod upload;

pub use clock::{Clock, ManualClock, SystemClock};
pub use daemon::{Daemon, DaemonConfig, DaemonStats};
pub use error::{ErrorKind, RecorderError, RecorderResult};
pub use permissions::{Authorizer, ClientCredentials, PermissionGate, PermissionState, UidAuthorizer};
pub use protocol::{EventSequence, RecorderClient, RecorderServer};
pub use recording::{ClientSession, EventRecorder};
pub use storage::{TallyPeriod, TallyRow, TallyStore};
pub use types::{ClientId, EventId, Payload, PayloadValue, StatisticsFlags, TimerHandle};
