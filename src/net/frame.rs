//! Endpoint wire framing
//!
//! Wire format: `[4-byte big-endian length][1-byte kind][payload]`, where the
//! length covers the kind byte plus the payload. Kind `0` carries data, kind
//! `1` is the stop sentinel sent by a graceful close.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Maximum encoded frame length (kind byte + payload)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const KIND_DATA: u8 = 0;
const KIND_STOP: u8 = 1;

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    Stop,
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends before a frame header, which is
/// how an aborted peer shows up.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len == 0 {
        return Err(Error::FrameMalformed {
            message: "zero-length frame".to_string(),
        });
    }
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let kind = reader.read_u8().await?;
    let mut payload = vec![0u8; len - 1];
    reader.read_exact(&mut payload).await?;

    match kind {
        KIND_DATA => Ok(Some(Frame::Data(payload))),
        KIND_STOP => Ok(Some(Frame::Stop)),
        other => Err(Error::FrameMalformed {
            message: format!("unknown frame kind {}", other),
        }),
    }
}

/// Write a data frame and flush
pub async fn write_data<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    write_raw(writer, KIND_DATA, payload).await
}

/// Write the stop sentinel and flush
pub async fn write_stop<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    write_raw(writer, KIND_STOP, &[]).await
}

async fn write_raw<W: AsyncWrite + Unpin>(writer: &mut W, kind: u8, payload: &[u8]) -> Result<()> {
    let len = payload.len() + 1;
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_u32(len as u32).await?;
    writer.write_u8(kind).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_data_then_stop() {
        let mut buf = Vec::new();
        write_data(&mut buf, b"hello").await.unwrap();
        write_stop(&mut buf).await.unwrap();

        assert_eq!(&buf[..5], &[0, 0, 0, 6, KIND_DATA]);

        let mut reader = buf.as_slice();
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Some(Frame::Data(b"hello".to_vec()))
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(Frame::Stop));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        let mut reader = &header[..];

        match read_frame(&mut reader).await {
            Err(Error::FrameTooLarge { size, max }) => {
                assert_eq!(size, MAX_FRAME_SIZE + 1);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let bytes = [0u8, 0, 0, 1, 7];
        let mut reader = &bytes[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(Error::FrameMalformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let bytes = [0u8, 0, 0, 10, KIND_DATA, 1, 2];
        let mut reader = &bytes[..];
        assert!(read_frame(&mut reader).await.is_err());
    }
}
