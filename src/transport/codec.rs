//! Frame codec for the plugin socket.
//!
//! Wire format, one [`DpMessage`] per frame:
//!
//! ```text
//! [len: u32 (big-endian)][JSON payload of exactly `len` bytes]
//! ```
//!
//! A stream may carry many frames back to back; `ListAndWatch` connections
//! rely on this to deliver repeated `DeviceList` frames.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DpError;
use crate::message::DpMessage;

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serialize `msg` and write it as one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, msg: &DpMessage) -> Result<(), DpError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(msg).map_err(DpError::internal)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(DpError::Transport(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    let len = payload.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(DpError::transport)?;
    writer.write_all(&payload).await.map_err(DpError::transport)?;
    writer.flush().await.map_err(DpError::transport)?;
    Ok(())
}

/// Read one frame, returning `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<DpMessage>, DpError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DpError::transport(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DpError::Transport(format!(
            "peer announced a {len} byte frame, limit is {MAX_FRAME_LEN}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(DpError::transport)?;

    let msg: DpMessage = serde_json::from_slice(&payload)
        .map_err(|e| DpError::Transport(format!("malformed frame: {e}")))?;
    Ok(Some(msg))
}
