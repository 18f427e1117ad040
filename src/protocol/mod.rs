//! Recording protocol over a Unix domain socket.

pub mod client;
pub mod framing;
pub mod messages;
pub mod server;

pub use client::{EventSequence, RecorderClient};
pub use framing::{read_message, write_message, FrameError, MAX_FRAME_SIZE};
pub use messages::{Envelope, Request, Response, SequenceEntry, PROTOCOL_VERSION};
pub use server::RecorderServer;
