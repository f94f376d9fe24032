// SPDX-License-Identifier: MIT OR Apache-2.0
//! The compiled protocol: artifact streaming and notifications.
//!
//! A successful OPEN reply carries `stream_size`, after which the server
//! writes exactly that many bytes of artifact content on the same
//! connection; the connection carries nothing else until the stream is
//! consumed.

use crate::{frame, wire, Decoder, Notification, NotifyKind, ProtocolError, RESULT_OK};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// Message ids of the compiled protocol.
pub mod msg {
    /// Open the static artifact for `(uuid, platform)`.
    pub const OPEN_STATIC: u32 = 1;
    /// Reply to [`OPEN_STATIC`].
    pub const OPEN_STATIC_RESULT: u32 = 2;
    /// Open the dynamic artifact for `(uuid, platform)`.
    pub const OPEN_DYNAMIC: u32 = 3;
    /// Reply to [`OPEN_DYNAMIC`].
    pub const OPEN_DYNAMIC_RESULT: u32 = 4;
    /// Resource created notification.
    pub const NOTIFY_CREATE: u32 = 5;
    /// Resource modified notification.
    pub const NOTIFY_MODIFY: u32 = 6;
    /// Dependency changed notification.
    pub const NOTIFY_DEPENDS: u32 = 7;
    /// Resource deleted notification.
    pub const NOTIFY_DELETE: u32 = 8;
}

/// An open request for a compiled artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRequest {
    /// Resource to open.
    pub uuid: Uuid,
    /// Packed target platform; the server applies reduction fallback.
    pub platform: u64,
    /// `true` for the dynamic (`.blob`) artifact.
    pub dynamic: bool,
}

impl OpenRequest {
    /// The request's message id.
    #[must_use]
    pub fn id(&self) -> u32 {
        if self.dynamic {
            msg::OPEN_DYNAMIC
        } else {
            msg::OPEN_STATIC
        }
    }

    /// The id of the reply this request expects.
    #[must_use]
    pub fn reply_id(&self) -> u32 {
        self.id() + 1
    }

    /// Encode the 24-byte payload.
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        wire::put_uuid(&mut out, self.uuid);
        wire::put_u64(&mut out, self.platform);
        out
    }

    /// Decode a payload for `id`.
    pub fn decode_payload(id: u32, payload: &[u8]) -> Result<Self, ProtocolError> {
        let dynamic = match id {
            msg::OPEN_STATIC => false,
            msg::OPEN_DYNAMIC => true,
            other => return Err(ProtocolError::UnknownMessage { id: other }),
        };
        let mut dec = Decoder::new(payload);
        let uuid = dec.uuid("open uuid")?;
        let platform = dec.u64("open platform")?;
        dec.finish("open request")?;
        Ok(Self {
            uuid,
            platform,
            dynamic,
        })
    }
}

/// Write an open request.
pub async fn write_open_request<W>(writer: &mut W, request: &OpenRequest) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    frame::write_message(writer, request.id(), &request.encode_payload()).await
}

/// Read one client request.
pub async fn read_request<R>(reader: &mut R) -> Result<OpenRequest, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let header = frame::read_header(reader).await?;
    let payload = frame::read_payload(reader, header.size).await?;
    OpenRequest::decode_payload(header.id, &payload)
}

/// Write a successful open reply announcing `stream_size` bytes of body
/// to follow on this connection.
pub async fn write_open_reply<W>(
    writer: &mut W,
    reply_id: u32,
    stream_size: u64,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut body = Vec::with_capacity(8);
    wire::put_u64(&mut body, stream_size);
    frame::write_reply(writer, reply_id, RESULT_OK, 0, &body).await
}

/// Write an open failure; no stream follows.
pub async fn write_open_failure<W>(writer: &mut W, request_id: u32) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    frame::write_reply(writer, request_id + 1, crate::RESULT_FAILED, 0, &[]).await
}

/// A message the compiled server pushes to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Reply to the in-flight open; on success the artifact stream
    /// follows immediately on the connection.
    OpenReply {
        /// Reply message id.
        id: u32,
        /// Result word.
        result: u32,
        /// Bytes of artifact content that follow; zero on failure.
        stream_size: u64,
    },
    /// Broadcast notification.
    Notify(Notification),
}

/// `Some(kind)` when `id` is one of this protocol's notifications.
#[must_use]
pub fn notify_kind(id: u32) -> Option<NotifyKind> {
    match id {
        msg::NOTIFY_CREATE => Some(NotifyKind::Create),
        msg::NOTIFY_MODIFY => Some(NotifyKind::Modify),
        msg::NOTIFY_DEPENDS => Some(NotifyKind::Depends),
        msg::NOTIFY_DELETE => Some(NotifyKind::Delete),
        _ => None,
    }
}

/// The notification id for `kind`.
#[must_use]
pub fn notify_id(kind: NotifyKind) -> u32 {
    match kind {
        NotifyKind::Create => msg::NOTIFY_CREATE,
        NotifyKind::Modify => msg::NOTIFY_MODIFY,
        NotifyKind::Depends => msg::NOTIFY_DEPENDS,
        NotifyKind::Delete => msg::NOTIFY_DELETE,
    }
}

/// Write a notification frame.
pub async fn write_notification<W>(
    writer: &mut W,
    notification: &Notification,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    frame::write_message(
        writer,
        notify_id(notification.kind),
        &notification.encode_payload(),
    )
    .await
}

/// Read one server-to-client message. When this returns a successful
/// [`ServerMessage::OpenReply`], the caller owns the next `stream_size`
/// bytes of the connection.
pub async fn read_server_message<R>(reader: &mut R) -> Result<ServerMessage, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let header = frame::read_header(reader).await?;
    if let Some(kind) = notify_kind(header.id) {
        let payload = frame::read_payload(reader, header.size).await?;
        return Ok(ServerMessage::Notify(Notification::decode_payload(
            kind, &payload,
        )?));
    }
    if header.id != msg::OPEN_STATIC_RESULT && header.id != msg::OPEN_DYNAMIC_RESULT {
        return Err(ProtocolError::UnknownMessage { id: header.id });
    }
    let (result, _flags) = frame::read_reply_preamble(reader).await?;
    let body = frame::read_payload(reader, header.size).await?;
    let stream_size = if body.is_empty() {
        0
    } else {
        let mut dec = Decoder::new(&body);
        let size = dec.u64("stream size")?;
        dec.finish("open reply")?;
        size
    };
    Ok(ServerMessage::OpenReply {
        id: header.id,
        result,
        stream_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_request_round_trip() {
        let request = OpenRequest {
            uuid: Uuid::from_u128(0xabcd),
            platform: 12,
            dynamic: true,
        };
        let mut buf = Vec::new();
        write_open_request(&mut buf, &request).await.unwrap();
        assert_eq!(buf.len(), 8 + 24);
        assert_eq!(buf[0], msg::OPEN_DYNAMIC as u8);

        let decoded = read_request(&mut buf.as_slice()).await.unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn open_reply_carries_stream_size() {
        let mut buf = Vec::new();
        write_open_reply(&mut buf, msg::OPEN_STATIC_RESULT, 4096)
            .await
            .unwrap();
        // The stream body follows the reply on the same connection.
        buf.extend_from_slice(&[0u8; 16]);

        let mut cursor = buf.as_slice();
        let message = read_server_message(&mut cursor).await.unwrap();
        assert_eq!(
            message,
            ServerMessage::OpenReply {
                id: msg::OPEN_STATIC_RESULT,
                result: RESULT_OK,
                stream_size: 4096,
            }
        );
        // The remaining bytes belong to the artifact stream.
        assert_eq!(cursor.len(), 16);
    }

    #[tokio::test]
    async fn open_failure_has_zero_stream() {
        let mut buf = Vec::new();
        write_open_failure(&mut buf, msg::OPEN_DYNAMIC).await.unwrap();
        let message = read_server_message(&mut buf.as_slice()).await.unwrap();
        assert_eq!(
            message,
            ServerMessage::OpenReply {
                id: msg::OPEN_DYNAMIC_RESULT,
                result: crate::RESULT_FAILED,
                stream_size: 0,
            }
        );
    }

    #[tokio::test]
    async fn notification_round_trip() {
        let notification = Notification {
            kind: NotifyKind::Depends,
            uuid: Uuid::from_u128(1),
            platform: 0,
            token: 4,
        };
        let mut buf = Vec::new();
        write_notification(&mut buf, &notification).await.unwrap();
        let message = read_server_message(&mut buf.as_slice()).await.unwrap();
        assert_eq!(message, ServerMessage::Notify(notification));
    }
}
