//! Framing: 4-byte big-endian length prefix + UTF-8 JSON body.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{Envelope, ProtocolError};

const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The peer closed the connection at a frame boundary or mid-frame.
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(u32),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a message into a single frame: length prefix + JSON payload.
pub fn encode(msg: &Envelope) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(&msg.to_value()?).map_err(ProtocolError::Body)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Read exactly one frame. Loops over partial reads; EOF anywhere in the
/// frame maps to `ConnectionClosed`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Envelope, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_SIZE];
    read_exact_or_closed(reader, &mut prefix).await?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    read_exact_or_closed(reader, &mut payload).await?;
    let value: serde_json::Value =
        serde_json::from_slice(&payload).map_err(ProtocolError::Body)?;
    Ok(Envelope::from_value(value)?)
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, msg: &Envelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(WireError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}
