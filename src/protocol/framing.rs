//! Length-prefixed framing.
//!
//! ```text
//! +----------------------+---------------------------------+
//! | length: u32 (BE)     | bincode Envelope { version, body } |
//! +----------------------+---------------------------------+
//! ```

use super::messages::{Envelope, PROTOCOL_VERSION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {size} bytes exceeds the {max}-byte limit")]
    TooLarge { size: usize, max: usize },

    /// The frame was read completely but its body could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unsupported protocol version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
}

impl FrameError {
    /// Whether the stream is still aligned on a frame boundary.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Malformed(_) | FrameError::Version { .. })
    }
}

pub async fn write_message<W, T>(writer: &mut W, body: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let envelope = Envelope {
        version: PROTOCOL_VERSION,
        body,
    };
    let bytes =
        bincode::serialize(&envelope).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one message. Returns `Ok(None)` on a clean end of stream.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_be_bytes(len_buf) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = vec![0u8; size];
    reader.read_exact(&mut frame).await?;

    let version: u32 =
        bincode::deserialize(&frame).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if version != PROTOCOL_VERSION {
        return Err(FrameError::Version {
            found: version,
            expected: PROTOCOL_VERSION,
        });
    }

    let envelope: Envelope<T> =
        bincode::deserialize(&frame).map_err(|e| FrameError::Malformed(e.to_string()))?;
    Ok(Some(envelope.body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::Request;

    #[tokio::test]
    async fn test_message_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_message(&mut a, &Request::GetEnabled).await.unwrap();
        drop(a);

        let received: Option<Request> = read_message(&mut b).await.unwrap();
        assert_eq!(received, Some(Request::GetEnabled));
        let eof: Option<Request> = read_message(&mut b).await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn test_rejects_oversized_length() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let result: Result<Option<Request>, _> = read_message(&mut b).await;
        assert!(matches!(result, Err(FrameError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_rejects_wrong_version() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let bytes = bincode::serialize(&Envelope {
            version: 99u32,
            body: Request::GetEnabled,
        })
        .unwrap();
        a.write_all(&(bytes.len() as u32).to_be_bytes()).await.unwrap();
        a.write_all(&bytes).await.unwrap();

        let result: Result<Option<Request>, _> = read_message(&mut b).await;
        let err = result.unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, FrameError::Version { found: 99, .. }));
    }
}
