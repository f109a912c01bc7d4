//! Length-prefixed framing for the reliable control channel
//!
//! Frame layout: `u32` big-endian payload length, then exactly that many
//! payload bytes. Payloads above [`crate::MAX_FRAME_SIZE`] are rejected and
//! the connection is closed by the caller. A peer that declares a length and
//! then stalls is cut off after the read timeout; waiting *between* frames
//! is unbounded (liveness is the heartbeat monitor's job, not the codec's).

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Length prefix size in bytes.
pub const PREFIX_LEN: usize = 4;

/// Read one frame, returning its payload.
///
/// Blocks indefinitely waiting for the next length prefix, but once a length
/// is declared the remainder must arrive within `read_timeout`.
pub async fn read_frame<R>(reader: &mut R, max_len: usize, read_timeout: Duration) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        // EOF (or reset) while waiting for a prefix is a normal close.
        Err(_) => return Err(Error::ConnectionClosed),
    };

    if len > max_len {
        return Err(Error::FrameTooLarge { size: len, max: max_len });
    }

    let mut payload = BytesMut::zeroed(len);
    match tokio::time::timeout(read_timeout, reader.read_exact(&mut payload)).await {
        Ok(Ok(_)) => Ok(payload.freeze()),
        Ok(Err(_)) => Err(Error::ConnectionClosed),
        Err(_) => Err(Error::ReadTimeout),
    }
}

/// Prepend the length prefix to a payload, producing one contiguous buffer.
///
/// Fan-out encodes each record once and enqueues the same `Bytes` for every
/// recipient, so the prefix is baked in here rather than at write time.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Write one frame (prefix + payload) and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
