// SPDX-License-Identifier: MIT OR Apache-2.0
//! The sourced protocol: source-side operations and notifications.
//!
//! Message ids are a stable enumeration; a request's reply id is always
//! `request + 1`. Failure replies are empty-bodied with a nonzero result
//! word, so every reply decoder here assumes a successful result.

use crate::{frame, wire, Decoder, Notification, NotifyKind, ProtocolError, RESULT_OK};
use rp_core::ContentHash;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// Message ids of the sourced protocol.
pub mod msg {
    /// Path → UUID lookup.
    pub const LOOKUP: u32 = 1;
    /// Reply to [`LOOKUP`].
    pub const LOOKUP_RESULT: u32 = 2;
    /// UUID → path lookup.
    pub const REVERSE_LOOKUP: u32 = 3;
    /// Reply to [`REVERSE_LOOKUP`].
    pub const REVERSE_LOOKUP_RESULT: u32 = 4;
    /// Import a file on the server side.
    pub const IMPORT: u32 = 5;
    /// Reply to [`IMPORT`].
    pub const IMPORT_RESULT: u32 = 6;
    /// Read a full source change log.
    pub const READ: u32 = 7;
    /// Reply to [`READ`].
    pub const READ_RESULT: u32 = 8;
    /// Source hash query.
    pub const HASH: u32 = 9;
    /// Reply to [`HASH`].
    pub const HASH_RESULT: u32 = 10;
    /// Direct dependency enumeration.
    pub const DEPENDENCIES: u32 = 11;
    /// Reply to [`DEPENDENCIES`].
    pub const DEPENDENCIES_RESULT: u32 = 12;
    /// Blob sidecar fetch.
    pub const READ_BLOB: u32 = 13;
    /// Reply to [`READ_BLOB`].
    pub const READ_BLOB_RESULT: u32 = 14;
    /// Apply a value change to a source.
    pub const SET: u32 = 15;
    /// Reply to [`SET`].
    pub const SET_RESULT: u32 = 16;
    /// Apply an unset change to a source.
    pub const UNSET: u32 = 17;
    /// Reply to [`UNSET`].
    pub const UNSET_RESULT: u32 = 18;
    /// Delete a resource.
    pub const DELETE: u32 = 19;
    /// Reply to [`DELETE`].
    pub const DELETE_RESULT: u32 = 20;
    /// Resource created notification.
    pub const NOTIFY_CREATE: u32 = 21;
    /// Resource modified notification.
    pub const NOTIFY_MODIFY: u32 = 22;
    /// Dependency changed notification.
    pub const NOTIFY_DEPENDS: u32 = 23;
    /// Resource deleted notification.
    pub const NOTIFY_DELETE: u32 = 24;
}

const CHANGE_FLAG_VALUE: u32 = 0;
const CHANGE_FLAG_BLOB: u32 = 1;
const CHANGE_FLAG_UNSET: u32 = 2;

/// Size of one change record on the wire.
pub const WIRE_CHANGE_SIZE: usize = 48;

/// A change as carried by READ_RESULT, with value bytes resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChange {
    /// Change timestamp.
    pub timestamp: i64,
    /// Key hash.
    pub key: u64,
    /// Packed platform.
    pub platform: u64,
    /// Payload.
    pub payload: SourceChangePayload,
}

/// Payload of a [`SourceChange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceChangePayload {
    /// Inline value bytes.
    Value(Vec<u8>),
    /// Out-of-line blob reference.
    Blob {
        /// Sidecar checksum.
        checksum: u64,
        /// Blob size in bytes.
        size: u64,
    },
    /// Key removed.
    Unset,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A client request of the sourced protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcedRequest {
    /// Resolve a path to `(uuid, signature-hash)`.
    Lookup {
        /// Path to resolve.
        path: String,
    },
    /// Resolve a UUID back to its imported path.
    ReverseLookup {
        /// Resource to resolve.
        uuid: Uuid,
    },
    /// Import (or re-import) a file server-side.
    Import {
        /// Path to import.
        path: String,
    },
    /// Fetch the full change log of a source.
    Read {
        /// Resource to read.
        uuid: Uuid,
    },
    /// Fetch the source hash for `(uuid, platform)`.
    Hash {
        /// Resource.
        uuid: Uuid,
        /// Packed platform.
        platform: u64,
    },
    /// Enumerate direct dependencies of `(uuid, platform)`.
    Dependencies {
        /// Resource.
        uuid: Uuid,
        /// Packed platform.
        platform: u64,
    },
    /// Fetch a blob sidecar payload.
    ReadBlob {
        /// Resource.
        uuid: Uuid,
        /// Packed platform.
        platform: u64,
        /// Change key owning the blob.
        key: u64,
    },
    /// Apply a value change to the server-side source.
    Set {
        /// Resource.
        uuid: Uuid,
        /// Change key.
        key: u64,
        /// Packed platform.
        platform: u64,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Apply an unset change to the server-side source.
    Unset {
        /// Resource.
        uuid: Uuid,
        /// Change key.
        key: u64,
        /// Packed platform.
        platform: u64,
    },
    /// Delete a resource and everything derived from it.
    Delete {
        /// Resource.
        uuid: Uuid,
    },
}

impl SourcedRequest {
    /// The request's message id.
    #[must_use]
    pub fn id(&self) -> u32 {
        match self {
            Self::Lookup { .. } => msg::LOOKUP,
            Self::ReverseLookup { .. } => msg::REVERSE_LOOKUP,
            Self::Import { .. } => msg::IMPORT,
            Self::Read { .. } => msg::READ,
            Self::Hash { .. } => msg::HASH,
            Self::Dependencies { .. } => msg::DEPENDENCIES,
            Self::ReadBlob { .. } => msg::READ_BLOB,
            Self::Set { .. } => msg::SET,
            Self::Unset { .. } => msg::UNSET,
            Self::Delete { .. } => msg::DELETE,
        }
    }

    /// The id of the reply this request expects.
    #[must_use]
    pub fn reply_id(&self) -> u32 {
        self.id() + 1
    }

    /// Encode the request payload.
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Lookup { path } | Self::Import { path } => {
                out.extend_from_slice(path.as_bytes());
            }
            Self::ReverseLookup { uuid } | Self::Read { uuid } | Self::Delete { uuid } => {
                wire::put_uuid(&mut out, *uuid);
            }
            Self::Hash { uuid, platform } | Self::Dependencies { uuid, platform } => {
                wire::put_uuid(&mut out, *uuid);
                wire::put_u64(&mut out, *platform);
            }
            Self::ReadBlob {
                uuid,
                platform,
                key,
            } => {
                wire::put_uuid(&mut out, *uuid);
                wire::put_u64(&mut out, *platform);
                wire::put_u64(&mut out, *key);
            }
            Self::Set {
                uuid,
                key,
                platform,
                value,
            } => {
                wire::put_uuid(&mut out, *uuid);
                wire::put_u64(&mut out, *key);
                wire::put_u64(&mut out, *platform);
                out.extend_from_slice(value);
            }
            Self::Unset {
                uuid,
                key,
                platform,
            } => {
                wire::put_uuid(&mut out, *uuid);
                wire::put_u64(&mut out, *key);
                wire::put_u64(&mut out, *platform);
            }
        }
        out
    }

    /// Decode a request payload for `id`.
    pub fn decode_payload(id: u32, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(payload);
        let request = match id {
            msg::LOOKUP | msg::IMPORT => {
                let path = String::from_utf8(dec.rest().to_vec())
                    .map_err(|_| ProtocolError::Malformed { what: "path utf-8" })?;
                if id == msg::LOOKUP {
                    Self::Lookup { path }
                } else {
                    Self::Import { path }
                }
            }
            msg::REVERSE_LOOKUP => Self::ReverseLookup {
                uuid: dec.uuid("uuid")?,
            },
            msg::READ => Self::Read {
                uuid: dec.uuid("uuid")?,
            },
            msg::DELETE => Self::Delete {
                uuid: dec.uuid("uuid")?,
            },
            msg::HASH => Self::Hash {
                uuid: dec.uuid("uuid")?,
                platform: dec.u64("platform")?,
            },
            msg::DEPENDENCIES => Self::Dependencies {
                uuid: dec.uuid("uuid")?,
                platform: dec.u64("platform")?,
            },
            msg::READ_BLOB => Self::ReadBlob {
                uuid: dec.uuid("uuid")?,
                platform: dec.u64("platform")?,
                key: dec.u64("key")?,
            },
            msg::SET => Self::Set {
                uuid: dec.uuid("uuid")?,
                key: dec.u64("key")?,
                platform: dec.u64("platform")?,
                value: dec.rest().to_vec(),
            },
            msg::UNSET => Self::Unset {
                uuid: dec.uuid("uuid")?,
                key: dec.u64("key")?,
                platform: dec.u64("platform")?,
            },
            other => return Err(ProtocolError::UnknownMessage { id: other }),
        };
        dec.finish("request")?;
        Ok(request)
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// A successful reply of the sourced protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcedReply {
    /// `(uuid, signature-hash)` for a path.
    Lookup {
        /// Resolved resource.
        uuid: Uuid,
        /// Signature hash stored in the import map.
        hash: ContentHash,
    },
    /// Path for a UUID.
    ReverseLookup {
        /// Resolved path.
        path: String,
    },
    /// Import outcome.
    Import {
        /// Assigned (or re-used) resource UUID.
        uuid: Uuid,
        /// New signature hash.
        hash: ContentHash,
    },
    /// Full change log.
    Read {
        /// Source content hash.
        hash: ContentHash,
        /// Every change in append order.
        changes: Vec<SourceChange>,
    },
    /// Source hash.
    Hash {
        /// Source content hash.
        hash: ContentHash,
    },
    /// Direct dependencies.
    Dependencies {
        /// `(uuid, platform)` pairs.
        deps: Vec<(Uuid, u64)>,
    },
    /// Blob payload.
    ReadBlob {
        /// Sidecar checksum.
        checksum: u64,
        /// Blob bytes.
        bytes: Vec<u8>,
    },
    /// Value change applied.
    Set,
    /// Unset change applied.
    Unset,
    /// Resource deleted.
    Delete,
}

impl SourcedReply {
    /// The reply's message id.
    #[must_use]
    pub fn id(&self) -> u32 {
        match self {
            Self::Lookup { .. } => msg::LOOKUP_RESULT,
            Self::ReverseLookup { .. } => msg::REVERSE_LOOKUP_RESULT,
            Self::Import { .. } => msg::IMPORT_RESULT,
            Self::Read { .. } => msg::READ_RESULT,
            Self::Hash { .. } => msg::HASH_RESULT,
            Self::Dependencies { .. } => msg::DEPENDENCIES_RESULT,
            Self::ReadBlob { .. } => msg::READ_BLOB_RESULT,
            Self::Set => msg::SET_RESULT,
            Self::Unset => msg::UNSET_RESULT,
            Self::Delete => msg::DELETE_RESULT,
        }
    }

    /// Encode the reply body (everything after the preamble).
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Lookup { uuid, hash } | Self::Import { uuid, hash } => {
                wire::put_uuid(&mut out, *uuid);
                wire::put_hash(&mut out, *hash);
            }
            Self::ReverseLookup { path } => out.extend_from_slice(path.as_bytes()),
            Self::Read { hash, changes } => {
                out = encode_read_body(*hash, changes);
            }
            Self::Hash { hash } => wire::put_hash(&mut out, *hash),
            Self::Dependencies { deps } => {
                wire::put_u64(&mut out, deps.len() as u64);
                for (uuid, platform) in deps {
                    wire::put_uuid(&mut out, *uuid);
                    wire::put_u64(&mut out, *platform);
                }
            }
            Self::ReadBlob { checksum, bytes } => {
                wire::put_u64(&mut out, *checksum);
                wire::put_u64(&mut out, bytes.len() as u64);
                out.extend_from_slice(bytes);
            }
            Self::Set | Self::Unset | Self::Delete => {}
        }
        out
    }

    /// Decode a successful reply body for `id`.
    pub fn decode_body(id: u32, body: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(body);
        let reply = match id {
            msg::LOOKUP_RESULT => Self::Lookup {
                uuid: dec.uuid("uuid")?,
                hash: dec.hash("hash")?,
            },
            msg::IMPORT_RESULT => Self::Import {
                uuid: dec.uuid("uuid")?,
                hash: dec.hash("hash")?,
            },
            msg::REVERSE_LOOKUP_RESULT => Self::ReverseLookup {
                path: String::from_utf8(dec.rest().to_vec())
                    .map_err(|_| ProtocolError::Malformed { what: "path utf-8" })?,
            },
            msg::READ_RESULT => {
                let (hash, changes) = decode_read_body(body)?;
                return Ok(Self::Read { hash, changes });
            }
            msg::HASH_RESULT => Self::Hash {
                hash: dec.hash("hash")?,
            },
            msg::DEPENDENCIES_RESULT => {
                let count = dec.u64("dependency count")?;
                let mut deps = Vec::new();
                for _ in 0..count {
                    deps.push((dec.uuid("dep uuid")?, dec.u64("dep platform")?));
                }
                Self::Dependencies { deps }
            }
            msg::READ_BLOB_RESULT => {
                let checksum = dec.u64("blob checksum")?;
                let size = dec.u64("blob size")? as usize;
                Self::ReadBlob {
                    checksum,
                    bytes: dec.bytes(size, "blob bytes")?.to_vec(),
                }
            }
            msg::SET_RESULT => Self::Set,
            msg::UNSET_RESULT => Self::Unset,
            msg::DELETE_RESULT => Self::Delete,
            other => return Err(ProtocolError::UnknownMessage { id: other }),
        };
        dec.finish("reply")?;
        Ok(reply)
    }
}

// ---------------------------------------------------------------------------
// READ_RESULT body
// ---------------------------------------------------------------------------

/// Encode `{hash, change_count, changes[], value_bytes[]}`.
///
/// String offsets are measured from the start of the body (the hash
/// field); the value region is the concatenation of every value payload
/// in change order.
fn encode_read_body(hash: ContentHash, changes: &[SourceChange]) -> Vec<u8> {
    let fixed = 32 + 4 + changes.len() * WIRE_CHANGE_SIZE;
    let mut values: Vec<u8> = Vec::new();
    let mut out = Vec::with_capacity(fixed);
    wire::put_hash(&mut out, hash);
    wire::put_u32(&mut out, changes.len() as u32);
    for change in changes {
        wire::put_i64(&mut out, change.timestamp);
        wire::put_u64(&mut out, change.key);
        wire::put_u64(&mut out, change.platform);
        match &change.payload {
            SourceChangePayload::Value(bytes) => {
                wire::put_u32(&mut out, CHANGE_FLAG_VALUE);
                wire::put_u32(&mut out, 0); // pad
                wire::put_u64(&mut out, (fixed + values.len()) as u64);
                wire::put_u64(&mut out, bytes.len() as u64);
                values.extend_from_slice(bytes);
            }
            SourceChangePayload::Blob { checksum, size } => {
                wire::put_u32(&mut out, CHANGE_FLAG_BLOB);
                wire::put_u32(&mut out, 0);
                wire::put_u64(&mut out, *checksum);
                wire::put_u64(&mut out, *size);
            }
            SourceChangePayload::Unset => {
                wire::put_u32(&mut out, CHANGE_FLAG_UNSET);
                wire::put_u32(&mut out, 0);
                wire::put_u64(&mut out, 0);
                wire::put_u64(&mut out, 0);
            }
        }
    }
    out.extend_from_slice(&values);
    out
}

fn decode_read_body(body: &[u8]) -> Result<(ContentHash, Vec<SourceChange>), ProtocolError> {
    let mut dec = Decoder::new(body);
    let hash = dec.hash("source hash")?;
    let count = dec.u32("change count")? as usize;
    let mut changes = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let timestamp = dec.i64("change ts")?;
        let key = dec.u64("change key")?;
        let platform = dec.u64("change platform")?;
        let flags = dec.u32("change flags")?;
        let _pad = dec.u32("change pad")?;
        let a = dec.u64("change word a")?;
        let b = dec.u64("change word b")?;
        let payload = match flags {
            CHANGE_FLAG_VALUE => {
                let offset = a as usize;
                let length = b as usize;
                let end = offset.checked_add(length).ok_or(ProtocolError::Malformed {
                    what: "value offset out of range",
                })?;
                let bytes = body.get(offset..end).ok_or(ProtocolError::Malformed {
                    what: "value offset out of range",
                })?;
                SourceChangePayload::Value(bytes.to_vec())
            }
            CHANGE_FLAG_BLOB => SourceChangePayload::Blob {
                checksum: a,
                size: b,
            },
            CHANGE_FLAG_UNSET => SourceChangePayload::Unset,
            _ => {
                return Err(ProtocolError::Malformed {
                    what: "change flags",
                })
            }
        };
        changes.push(SourceChange {
            timestamp,
            key,
            platform,
            payload,
        });
    }
    Ok((hash, changes))
}

// ---------------------------------------------------------------------------
// Stream helpers
// ---------------------------------------------------------------------------

/// A message the server can push to a client: a correlated reply or an
/// uncorrelated notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Reply to the in-flight request.
    Reply {
        /// Reply message id.
        id: u32,
        /// Result word (`RESULT_OK` / `RESULT_FAILED`).
        result: u32,
        /// Flags word.
        flags: u32,
        /// Reply body.
        body: Vec<u8>,
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

/// Write a request frame.
pub async fn write_request<W>(writer: &mut W, request: &SourcedRequest) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    frame::write_message(writer, request.id(), &request.encode_payload()).await
}

/// Write a successful reply frame.
pub async fn write_reply<W>(writer: &mut W, reply: &SourcedReply) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    frame::write_reply(writer, reply.id(), RESULT_OK, 0, &reply.encode_body()).await
}

/// Write an empty-bodied failure reply for the request carrying
/// `request_id`.
pub async fn write_failure<W>(writer: &mut W, request_id: u32) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    frame::write_reply(writer, request_id + 1, crate::RESULT_FAILED, 0, &[]).await
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

/// Read one client request. The server processes one request at a time
/// per connection, so this is the only read the server loop performs.
pub async fn read_request<R>(reader: &mut R) -> Result<SourcedRequest, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let header = frame::read_header(reader).await?;
    let payload = frame::read_payload(reader, header.size).await?;
    SourcedRequest::decode_payload(header.id, &payload)
}

/// Read one server-to-client message, reply or notification.
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
    let (result, flags) = frame::read_reply_preamble(reader).await?;
    let body = frame::read_payload(reader, header.size).await?;
    Ok(ServerMessage::Reply {
        id: header.id,
        result,
        flags,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_wire_bytes_are_exact() {
        // LOOKUP "foo/bar": id 1, size 7, then the path bytes.
        let mut buf = Vec::new();
        write_request(
            &mut buf,
            &SourcedRequest::Lookup {
                path: "foo/bar".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            buf,
            [
                0x01, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, b'f', b'o', b'o', b'/', b'b',
                b'a', b'r',
            ]
        );
    }

    #[tokio::test]
    async fn lookup_reply_is_48_byte_body() {
        let mut buf = Vec::new();
        write_reply(
            &mut buf,
            &SourcedReply::Lookup {
                uuid: Uuid::nil(),
                hash: ContentHash::ZERO,
            },
        )
        .await
        .unwrap();
        // id 2, size 48, result 0, flags 0, uuid, hash.
        assert_eq!(buf.len(), 8 + 8 + 48);
        assert_eq!(&buf[0..8], &[0x02, 0, 0, 0, 0x30, 0, 0, 0]);
        assert!(buf[8..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn request_round_trips() {
        let uuid = Uuid::from_u128(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
        let requests = [
            SourcedRequest::Lookup {
                path: "a/b.png".into(),
            },
            SourcedRequest::ReverseLookup { uuid },
            SourcedRequest::Import {
                path: "c/d.wav".into(),
            },
            SourcedRequest::Read { uuid },
            SourcedRequest::Hash { uuid, platform: 5 },
            SourcedRequest::Dependencies { uuid, platform: 0 },
            SourcedRequest::ReadBlob {
                uuid,
                platform: 2,
                key: 77,
            },
            SourcedRequest::Set {
                uuid,
                key: 3,
                platform: 9,
                value: b"value bytes".to_vec(),
            },
            SourcedRequest::Unset {
                uuid,
                key: 3,
                platform: 9,
            },
            SourcedRequest::Delete { uuid },
        ];
        for request in requests {
            let payload = request.encode_payload();
            let decoded = SourcedRequest::decode_payload(request.id(), &payload).unwrap();
            assert_eq!(decoded, request);
        }
    }

    #[tokio::test]
    async fn reply_round_trips() {
        let uuid = Uuid::from_u128(7);
        let hash = ContentHash::of(b"content");
        let replies = [
            SourcedReply::Lookup { uuid, hash },
            SourcedReply::ReverseLookup {
                path: "textures/stone.png".into(),
            },
            SourcedReply::Import { uuid, hash },
            SourcedReply::Hash { hash },
            SourcedReply::Dependencies {
                deps: vec![(Uuid::from_u128(1), 0), (Uuid::from_u128(2), 9)],
            },
            SourcedReply::ReadBlob {
                checksum: 0xfeed,
                bytes: b"blob".to_vec(),
            },
            SourcedReply::Set,
            SourcedReply::Unset,
            SourcedReply::Delete,
        ];
        for reply in replies {
            let body = reply.encode_body();
            let decoded = SourcedReply::decode_body(reply.id(), &body).unwrap();
            assert_eq!(decoded, reply);
        }
    }

    #[test]
    fn read_body_offsets_resolve() {
        let changes = vec![
            SourceChange {
                timestamp: 1,
                key: 10,
                platform: 0,
                payload: SourceChangePayload::Value(b"alpha".to_vec()),
            },
            SourceChange {
                timestamp: 2,
                key: 11,
                platform: 4,
                payload: SourceChangePayload::Blob {
                    checksum: 0xc0de,
                    size: 512,
                },
            },
            SourceChange {
                timestamp: 3,
                key: 10,
                platform: 4,
                payload: SourceChangePayload::Unset,
            },
            SourceChange {
                timestamp: 4,
                key: 12,
                platform: 0,
                payload: SourceChangePayload::Value(b"beta".to_vec()),
            },
        ];
        let hash = ContentHash::of(b"log");
        let body = encode_read_body(hash, &changes);
        // Fixed region then concatenated values.
        assert_eq!(body.len(), 32 + 4 + 4 * WIRE_CHANGE_SIZE + 5 + 4);

        let (decoded_hash, decoded) = decode_read_body(&body).unwrap();
        assert_eq!(decoded_hash, hash);
        assert_eq!(decoded, changes);
    }

    #[test]
    fn read_body_with_bad_offset_is_malformed() {
        let changes = vec![SourceChange {
            timestamp: 1,
            key: 1,
            platform: 0,
            payload: SourceChangePayload::Value(b"x".to_vec()),
        }];
        let mut body = encode_read_body(ContentHash::ZERO, &changes);
        // Corrupt the offset word of the first change.
        let offset_pos = 32 + 4 + 24 + 8;
        body[offset_pos..offset_pos + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(decode_read_body(&body).is_err());
    }

    #[tokio::test]
    async fn notifications_bypass_reply_preamble() {
        let notification = Notification {
            kind: NotifyKind::Modify,
            uuid: Uuid::from_u128(3),
            platform: 4,
            token: 99,
        };
        let mut buf = Vec::new();
        write_notification(&mut buf, &notification).await.unwrap();
        assert_eq!(buf.len(), 8 + 32);

        let message = read_server_message(&mut buf.as_slice()).await.unwrap();
        assert_eq!(message, ServerMessage::Notify(notification));
    }

    #[tokio::test]
    async fn failure_reply_has_empty_body() {
        let mut buf = Vec::new();
        write_failure(&mut buf, msg::LOOKUP).await.unwrap();
        let message = read_server_message(&mut buf.as_slice()).await.unwrap();
        match message {
            ServerMessage::Reply {
                id, result, body, ..
            } => {
                assert_eq!(id, msg::LOOKUP_RESULT);
                assert_eq!(result, crate::RESULT_FAILED);
                assert!(body.is_empty());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unknown_request_id_rejected() {
        let err = SourcedRequest::decode_payload(999, &[]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessage { id: 999 }));
    }
}
