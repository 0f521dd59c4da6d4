//! Broker wire protocol: length-prefixed bincode frames over TCP

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version exchanged in the handshake
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest frame either side will read: 16 MB
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A frame exchanged between a broker and one of its links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame from a link
    Hello { client_id: String, version: u8 },
    /// Broker accepts the link
    HelloAck { version: u8 },
    Subscribe { filter: String },
    Unsubscribe { filter: String },
    /// Link to broker: publish. Broker to link: a delivery.
    Publish { topic: String, payload: Vec<u8> },
    /// Clean close from either side
    Goodbye,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid frame length: {0}")]
    InvalidFrameLength(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "Hello",
            Frame::HelloAck { .. } => "HelloAck",
            Frame::Subscribe { .. } => "Subscribe",
            Frame::Unsubscribe { .. } => "Unsubscribe",
            Frame::Publish { .. } => "Publish",
            Frame::Goodbye => "Goodbye",
        }
    }
}

/// Write one frame: big-endian u32 length, then the bincode body
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.to_bytes()?;
    if body.is_empty() || body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::InvalidFrameLength(body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(ProtocolError::InvalidFrameLength(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::from_bytes(&body).map(Some)
}
