//! Recording side of the daemon: buffered events, aggregate timers, and the
//! recorder that routes client calls between them.

pub mod buffer;
pub mod event;
pub mod recorder;
pub mod timers;

pub use buffer::{UploadBuffer, DEFAULT_MAX_BYTES_BUFFERED, MAX_REQUEST_PAYLOAD};
pub use event::{AggregateEvent, EventRecord, SequenceEvent, SequencePoint, SingularEvent};
pub use recorder::{ClientSession, EventRecorder};
pub use timers::{TimerRegistry, TimerStart};
