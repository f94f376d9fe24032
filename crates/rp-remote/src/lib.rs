// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reconnecting clients for the sourced and compiled services.
//!
//! Each client spawns one worker task that owns the connection and its
//! lifecycle. The caller-facing API is request/reply over a bounded
//! channel of depth one, so the wire never carries more than one
//! outstanding request; a request caught by a disconnect is re-issued
//! after reconnection. Notifications received at any time are posted to
//! the shared [`EventStream`](rp_events::EventStream) without touching
//! request correlation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod compiled;
mod sourced;
mod stream;

pub use backoff::Backoff;
pub use compiled::CompiledClient;
pub use sourced::SourcedClient;
pub use stream::CompiledStream;

use rp_events::EventKind;
use rp_protocol::NotifyKind;

/// Errors surfaced by remote client calls.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// No connected remote; the worker answered with a failure reply or
    /// has terminated.
    #[error("remote endpoint unavailable")]
    Unavailable,

    /// The remote processed the request and reported failure.
    #[error("remote request failed")]
    Failed,

    /// The reply did not decode.
    #[error(transparent)]
    Protocol(#[from] rp_protocol::ProtocolError),
}

pub(crate) fn event_kind(kind: NotifyKind) -> EventKind {
    match kind {
        NotifyKind::Create => EventKind::Create,
        NotifyKind::Modify => EventKind::Modify,
        NotifyKind::Depends => EventKind::Depends,
        NotifyKind::Delete => EventKind::Delete,
    }
}
