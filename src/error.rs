//! Error taxonomy surfaced to recording clients.
//!
//! Protocol-level rejections (`Disabled`, `UploadingDisabled`, `Unauthorized`,
//! `UnknownHandle`, `InvalidArgument`) are expected conditions returned to the
//! caller. `Storage` marks a failed commit; it never takes the daemon down.

use crate::types::TimerHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const METRICS_DISABLED_MESSAGE: &str =
    "Could not record or upload events because the metrics system is disabled";

pub const UPLOADING_DISABLED_MESSAGE: &str =
    "Could not upload events because uploading is disabled";

/// Errors returned by recorder operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecorderError {
    /// Consent is currently off.
    #[error("{}", METRICS_DISABLED_MESSAGE)]
    Disabled,

    /// Consent is on, but uploads are not yet permitted.
    #[error("{}", UPLOADING_DISABLED_MESSAGE)]
    UploadingDisabled,

    /// A privileged call lacked the required authorization.
    #[error("caller is not authorized to {action}")]
    Unauthorized { action: String },

    /// The timer was already stopped, never existed, or belongs to another client.
    #[error("unknown timer handle {0}")]
    UnknownHandle(TimerHandle),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Disk write error on the tally store, event cache, or a state file.
    #[error("storage failure: {0}")]
    Storage(String),

    /// The transport exhausted its attempts; the batch was kept for later.
    #[error("upload failed: {0}")]
    Upload(String),

    /// Malformed frame or unsupported protocol version.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RecorderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecorderError::Disabled => ErrorKind::MetricsDisabled,
            RecorderError::UploadingDisabled => ErrorKind::UploadingDisabled,
            RecorderError::Unauthorized { .. } => ErrorKind::Unauthorized,
            RecorderError::UnknownHandle(_) => ErrorKind::UnknownHandle,
            RecorderError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            RecorderError::Storage(_) => ErrorKind::StorageFailure,
            RecorderError::Upload(_) => ErrorKind::UploadFailed,
            RecorderError::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

/// Wire form of an error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    MetricsDisabled,
    UploadingDisabled,
    Unauthorized,
    UnknownHandle,
    InvalidArgument,
    StorageFailure,
    UploadFailed,
    Protocol,
}

/// Error as carried in a protocol response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
    /// Set for `UnknownHandle` so the client can rebuild the typed error.
    pub handle: Option<TimerHandle>,
}

impl From<&RecorderError> for ErrorReply {
    fn from(err: &RecorderError) -> Self {
        let handle = match err {
            RecorderError::UnknownHandle(handle) => Some(*handle),
            _ => None,
        };
        ErrorReply {
            kind: err.kind(),
            message: err.to_string(),
            handle,
        }
    }
}

impl From<ErrorReply> for RecorderError {
    fn from(reply: ErrorReply) -> Self {
        match reply.kind {
            ErrorKind::MetricsDisabled => RecorderError::Disabled,
            ErrorKind::UploadingDisabled => RecorderError::UploadingDisabled,
            ErrorKind::Unauthorized => RecorderError::Unauthorized {
                action: reply.message,
            },
            ErrorKind::UnknownHandle => {
                RecorderError::UnknownHandle(reply.handle.unwrap_or(TimerHandle(0)))
            }
            ErrorKind::InvalidArgument => RecorderError::InvalidArgument(reply.message),
            ErrorKind::StorageFailure => RecorderError::Storage(reply.message),
            ErrorKind::UploadFailed => RecorderError::Upload(reply.message),
            ErrorKind::Protocol => RecorderError::Protocol(reply.message),
        }
    }
}

pub type RecorderResult<T> = Result<T, RecorderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_handle_survives_wire_round_trip() {
        let err = RecorderError::UnknownHandle(TimerHandle(42));
        let reply = ErrorReply::from(&err);
        assert_eq!(reply.kind, ErrorKind::UnknownHandle);
        assert_eq!(RecorderError::from(reply), err);
    }

    #[test]
    fn test_disabled_kinds_are_distinct() {
        assert_ne!(
            RecorderError::Disabled.kind(),
            RecorderError::UploadingDisabled.kind()
        );
    }
}
