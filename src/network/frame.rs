//! Length-prefixed, versioned frames.
//!
//! ```text
//! +-------+-------------+----------------+------------------+
//! | NCTL  | version u16 | body length u32| body ...         |
//! +-------+-------------+----------------+------------------+
//! ```
//!
//! All integers are little-endian. One frame carries exactly one request or
//! one response, so a response is either received whole or not at all.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame magic.
pub const PROTOCOL_MAGIC: [u8; 4] = *b"NCTL";

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 10;

/// Framing failures.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The stream failed or ended inside a frame.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer is not speaking this protocol.
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),

    /// The peer speaks another protocol version.
    #[error("unsupported protocol version {0} (this side speaks {PROTOCOL_VERSION})")]
    UnsupportedVersion(u16),

    /// The announced body exceeds the configured limit.
    #[error("frame body of {len} bytes exceeds limit of {max} bytes")]
    TooLarge {
        /// Announced body length.
        len: u32,
        /// Configured limit.
        max: u32,
    },
}

/// Builds a complete frame around `body`.
#[must_use]
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_slice(&PROTOCOL_MAGIC);
    buf.put_u16_le(PROTOCOL_VERSION);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// Writes one frame and flushes.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(body)).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame body.
///
/// Returns `Ok(None)` if the stream ends cleanly before the first header
/// byte. A stream that ends anywhere inside a frame is an [`FrameError::Io`]
/// with kind `UnexpectedEof`.
pub async fn read_frame<R>(reader: &mut R, max_body: u32) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let n = reader.read(&mut header).await?;
    if n == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[n..]).await?;

    let magic = [header[0], header[1], header[2], header[3]];
    if magic != PROTOCOL_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
    if len > max_body {
        return Err(FrameError::TooLarge { len, max: max_body });
    }

    let mut body = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut body).await?;
    Ok(Some(body.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut a, mut b) = duplex(64);
        let writer = tokio::spawn(async move {
            write_frame(&mut a, b"first").await.unwrap();
            write_frame(&mut a, b"").await.unwrap();
        });
        let first = read_frame(&mut b, 1024).await.unwrap().unwrap();
        let second = read_frame(&mut b, 1024).await.unwrap().unwrap();
        writer.await.unwrap();
        assert_eq!(&first[..], b"first");
        assert!(second.is_empty());
        assert!(read_frame(&mut b, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_io_error() {
        let frame = encode_frame(b"0123456789");
        let mut cut: &[u8] = &frame[..frame.len() - 3];
        match read_frame(&mut cut, 1024).await {
            Err(FrameError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected eof, got {other:?}"),
        }

        let mut header_only: &[u8] = &frame[..4];
        assert!(matches!(
            read_frame(&mut header_only, 1024).await,
            Err(FrameError::Io(_))
        ));
    }

    #[tokio::test]
    async fn foreign_frames_are_rejected() {
        let mut http: &[u8] = b"GET / HTTP/1.1\r\n\r\n";
        assert!(matches!(
            read_frame(&mut http, 1024).await,
            Err(FrameError::BadMagic(m)) if &m == b"GET "
        ));

        let mut raw = encode_frame(b"x").to_vec();
        raw[4] = 9;
        let mut v9: &[u8] = &raw;
        assert!(matches!(
            read_frame(&mut v9, 1024).await,
            Err(FrameError::UnsupportedVersion(9))
        ));

        let big = encode_frame(&[0u8; 100]);
        let mut big: &[u8] = &big;
        assert!(matches!(
            read_frame(&mut big, 10).await,
            Err(FrameError::TooLarge { len: 100, max: 10 })
        ));
    }
}
