//! Upload pipeline:
//! 1. **On-demand** (`UploadService::upload`): triggered by `UploadEvents`
//! 2. **Scheduled** (`UploadScheduler`): periodic background task

pub mod batch;
pub mod scheduler;
pub mod service;
pub mod transport;

pub use batch::{
    read_machine_id, SendCounter, TallyAggregate, UploadBatch, CLIENT_VERSION,
    DEFAULT_MACHINE_ID_PATH, NETWORK_SEND_FILE_NAME,
};
pub use scheduler::{default_upload_interval, SchedulerConfig, UploadScheduler};
pub use service::{UploadConfig, UploadService, UploadStats, UploadTrigger};
pub use transport::{HttpTransport, MemoryTransport, Transport, TransportFuture};
