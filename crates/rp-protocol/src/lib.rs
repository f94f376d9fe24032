// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire protocols for the sourced and compiled resource services.
//!
//! Both protocols share the same framing: a little-endian
//! `{id:u32, size:u32}` header followed by the message payload. Replies
//! carry an additional fixed `{result:u32, flags:u32}` preamble between
//! header and body; `size` counts only the body, so a failure reply is
//! simply `size == 0` with a nonzero result word. Notifications are
//! server-initiated and framed like requests.
//!
//! Payload layouts are bit-exact; see [`sourced`] and [`compiled`] for
//! the per-message structs and the codec tests that pin the byte
//! sequences down.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod compiled;
pub mod frame;
pub mod sourced;
mod wire;

pub use frame::{MAX_FRAME_SIZE, REPLY_PREAMBLE_SIZE};
pub use wire::Decoder;

use uuid::Uuid;

/// Result word of a successful reply.
pub const RESULT_OK: u32 = 0;
/// Result word of a failed reply (not found, compile failure, bad input).
pub const RESULT_FAILED: u32 = 1;

/// Errors from framing and codecs.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Socket or stream failure.
    #[error("protocol i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A message id that neither protocol defines.
    #[error("unknown message id {id}")]
    UnknownMessage {
        /// The offending id.
        id: u32,
    },

    /// A declared size larger than any legal frame.
    #[error("declared frame size {size} exceeds limit")]
    Oversized {
        /// The declared size.
        size: u32,
    },

    /// A payload shorter than its layout requires.
    #[error("truncated payload while reading {what}")]
    Truncated {
        /// The field being decoded.
        what: &'static str,
    },

    /// A payload field with an invalid value.
    #[error("malformed payload: {what}")]
    Malformed {
        /// What was wrong.
        what: &'static str,
    },
}

/// Notification kinds shared by both protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// Resource created.
    Create,
    /// Resource source modified.
    Modify,
    /// A dependency of the resource changed.
    Depends,
    /// Resource deleted.
    Delete,
}

/// A `{uuid, platform, token}` notification payload, 32 bytes on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    /// What happened.
    pub kind: NotifyKind,
    /// Affected resource.
    pub uuid: Uuid,
    /// Packed platform scope.
    pub platform: u64,
    /// Trigger token for cascade deduplication.
    pub token: u64,
}

impl Notification {
    pub(crate) fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        wire::put_uuid(&mut out, self.uuid);
        wire::put_u64(&mut out, self.platform);
        wire::put_u64(&mut out, self.token);
        out
    }

    pub(crate) fn decode_payload(kind: NotifyKind, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(payload);
        let uuid = dec.uuid("notify uuid")?;
        let platform = dec.u64("notify platform")?;
        let token = dec.u64("notify token")?;
        dec.finish("notify")?;
        Ok(Self {
            kind,
            uuid,
            platform,
            token,
        })
    }
}
