//! On-disk state of the recorder.
//!
//! - **Tally store**: per-day and per-month counters committed by timers.
//! - **Event cache**: records waiting for a successful upload.

pub mod event_cache;
pub mod tally;
pub mod types;

pub use event_cache::{CachedRecord, EventCache, DEFAULT_MAX_CACHE_BYTES, EVENT_CACHE_DB_NAME};
pub use tally::{TallyStore, TALLY_DB_NAME};
pub use types::{TallyIncrement, TallyPeriod, TallyRow};
