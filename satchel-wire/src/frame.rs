//! Length-prefix framing: `varint(payload_length) || payload_bytes`.
//!
//! The prefix is the standard unsigned multibyte encoding (seven data bits
//! per byte, high bit as continuation). Oversize frames are rejected from
//! the length prefix alone, before the body is allocated.

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use thiserror::Error;
use unsigned_varint::{aio, encode, io::ReadError};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    Oversize { len: usize, max: usize },
    #[error("Malformed length prefix")]
    BadPrefix,
    #[error("Frame io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write one `varint(len) || payload` frame.
pub async fn write_frame<W>(
    io: &mut W,
    payload: &[u8],
    max_len: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + Send,
{
    if payload.len() > max_len {
        return Err(FrameError::Oversize {
            len: payload.len(),
            max: max_len,
        });
    }

    let mut prefix_buf = encode::usize_buffer();
    let prefix = encode::usize(payload.len(), &mut prefix_buf);
    io.write_all(prefix).await?;
    io.write_all(payload).await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` if the stream ends cleanly before a
/// frame starts (the fire-and-forget "no reply" case).
pub async fn read_frame<R>(
    io: &mut R,
    max_len: usize,
) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin + Send,
{
    let len = match aio::read_usize(&mut *io).await {
        Ok(len) => len,
        Err(ReadError::Io(e))
            if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            return Ok(None),
        Err(ReadError::Io(e)) => return Err(FrameError::Io(e)),
        Err(_) => return Err(FrameError::BadPrefix),
    };

    // Reject before allocating: the prefix alone is enough to know the
    // frame is oversize.
    if len > max_len {
        return Err(FrameError::Oversize { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
