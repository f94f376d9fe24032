// SPDX-License-Identifier: MIT OR Apache-2.0
//! Message framing over async byte streams.

use crate::{wire, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes in the `{id, size}` header.
pub const HEADER_SIZE: usize = 8;

/// Bytes in the `{result, flags}` reply preamble, not counted by `size`.
pub const REPLY_PREAMBLE_SIZE: usize = 8;

/// Upper bound on any declared frame size. A peer declaring more is
/// desynchronized or hostile; the connection is dropped either way.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// A decoded `{id, size}` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message id.
    pub id: u32,
    /// Declared payload size (body only, for replies).
    pub size: u32,
}

/// Read and validate a frame header.
pub async fn read_header<R>(reader: &mut R) -> Result<FrameHeader, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut buf).await?;
    let id = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
    let size = u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes"));
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::Oversized { size });
    }
    Ok(FrameHeader { id, size })
}

/// Read exactly `size` payload bytes.
pub async fn read_payload<R>(reader: &mut R, size: u32) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; size as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Read the `{result, flags}` preamble of a reply.
pub async fn read_reply_preamble<R>(reader: &mut R) -> Result<(u32, u32), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; REPLY_PREAMBLE_SIZE];
    reader.read_exact(&mut buf).await?;
    Ok((
        u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
        u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")),
    ))
}

/// Write a request or notification frame in one buffer.
pub async fn write_message<W>(writer: &mut W, id: u32, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    wire::put_u32(&mut frame, id);
    wire::put_u32(&mut frame, payload.len() as u32);
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a reply frame: header, preamble, body.
pub async fn write_reply<W>(
    writer: &mut W,
    id: u32,
    result: u32,
    flags: u32,
    body: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(HEADER_SIZE + REPLY_PREAMBLE_SIZE + body.len());
    wire::put_u32(&mut frame, id);
    wire::put_u32(&mut frame, body.len() as u32);
    wire::put_u32(&mut frame, result);
    wire::put_u32(&mut frame, flags);
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn header_round_trip() {
        let mut buf = Vec::new();
        write_message(&mut buf, 7, b"abc").await.unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 3);

        let mut cursor = buf.as_slice();
        let header = read_header(&mut cursor).await.unwrap();
        assert_eq!(header, FrameHeader { id: 7, size: 3 });
        assert_eq!(read_payload(&mut cursor, 3).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn reply_preamble_not_counted_in_size() {
        let mut buf = Vec::new();
        write_reply(&mut buf, 2, crate::RESULT_OK, 0, &[9u8; 48])
            .await
            .unwrap();
        let mut cursor = buf.as_slice();
        let header = read_header(&mut cursor).await.unwrap();
        assert_eq!(header.size, 48);
        let (result, flags) = read_reply_preamble(&mut cursor).await.unwrap();
        assert_eq!(result, crate::RESULT_OK);
        assert_eq!(flags, 0);
        assert_eq!(read_payload(&mut cursor, 48).await.unwrap(), vec![9u8; 48]);
    }

    #[tokio::test]
    async fn oversized_header_rejected() {
        let mut buf = Vec::new();
        wire::put_u32(&mut buf, 1);
        wire::put_u32(&mut buf, MAX_FRAME_SIZE + 1);
        let err = read_header(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { .. }));
    }
}
