//! Length-prefixed framing for the worker pipes.
//!
//! Each frame is an 8 byte little-endian unsigned length followed by that
//! many payload bytes. Framing is purely transport: no compression, no
//! checksum, the channel is a trusted local pipe.

use crate::error::ProtocolError;
use anyhow::Result;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame payload.
pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

/// Write one length-prefixed frame and flush the writer.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(payload.len() as u64).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean end of stream at a frame
/// boundary. A stream ending inside a frame, or a length above
/// [`MAX_FRAME_LEN`], is a [`ProtocolError`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 8];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u64::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len, MAX_FRAME_LEN).into());
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| ProtocolError::Truncated(len as usize))?;
    Ok(Some(payload))
}
