// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only resource change logs.
//!
//! A [`ResourceSource`] records every edit ever made to a resource as a
//! timestamped `(key, platform)` change: a value, a blob reference, or an
//! unset marker. Changes are held in fixed-capacity blocks whose arena
//! pages own the value bytes, so a value slice handed out by [`get`] stays
//! valid exactly as long as the source it came from.
//!
//! The log reads and writes a symmetric binary/text format
//! ([`ResourceSource::write_to`] / [`ResourceSource::read_from`]); the
//! canonical binary serialization doubles as the input of the source
//! content hash that compiled artifacts embed for up-to-date checks.
//! Blob payloads live out-of-line in sidecar files managed by
//! [`BlobStore`].
//!
//! [`get`]: ResourceSource::get

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob;
mod block;
mod change;
mod io;
mod source;

pub use blob::{BlobError, BlobStore, SidecarName};
pub use change::{ChangeSet, ChangeValue, ChangeView};
pub use io::SourceFormat;
pub use source::{ResourceSource, SourceState};

/// Errors reading or writing a source change log.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Filesystem or stream failure.
    #[error("source i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// The on-disk data does not parse as either source format.
    #[error("corrupt source data at byte {offset}: {reason}")]
    Corrupt {
        /// Byte offset of the first unparsable record.
        offset: usize,
        /// What failed to parse.
        reason: &'static str,
    },
}
