//! Length-prefixed framing over a byte stream.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! XDR-marshalled message. The top bit of the length word is reserved and
//! masked off by the reader.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame body. Anything larger is a protocol violation,
/// not a legitimate message.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

const LENGTH_MASK: u32 = 0x7fff_ffff;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds maximum message size")]
    TooLarge(u32),
}

/// Read one frame: header, then body. Masks the reserved top bit.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let length = u32::from_be_bytes(header) & LENGTH_MASK;
    if length > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(length));
    }
    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let header = (body.len() as u32).to_be_bytes();
    writer.write_all(&header).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
