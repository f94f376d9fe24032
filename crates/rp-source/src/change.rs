// SPDX-License-Identifier: MIT OR Apache-2.0
//! Change records and the views handed out to callers.

/// Location of an interned value inside its block's arena pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ValueRef {
    pub(crate) page: u32,
    pub(crate) offset: u32,
    pub(crate) len: u32,
}

/// Stored payload of a change. Value bytes are owned by the enclosing
/// block's arena; the record itself only carries the location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangePayload {
    Value(ValueRef),
    Blob { checksum: u64, size: u64 },
    Unset,
}

/// A single stored change record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Change {
    pub(crate) timestamp: i64,
    pub(crate) key: u64,
    pub(crate) platform: u64,
    pub(crate) payload: ChangePayload,
}

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

/// The payload of a change as seen by callers.
///
/// `Value` borrows from the owning source's arena; the bytes are valid for
/// the borrow of the source and are invalidated by
/// [`collapse_history`](crate::ResourceSource::collapse_history).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeValue<'a> {
    /// An interned byte value.
    Value(&'a [u8]),
    /// A reference to a blob sidecar file.
    Blob {
        /// 64-bit checksum naming the sidecar.
        checksum: u64,
        /// Blob size in bytes.
        size: u64,
    },
    /// The key was removed at this timestamp for this platform.
    Unset,
}

impl ChangeValue<'_> {
    /// `true` for [`ChangeValue::Unset`].
    #[must_use]
    pub fn is_unset(&self) -> bool {
        matches!(self, ChangeValue::Unset)
    }
}

/// A borrowed view of one change record.
#[derive(Debug, Clone, Copy)]
pub struct ChangeView<'a> {
    /// Monotonic tick at which the change was appended.
    pub timestamp: i64,
    /// 64-bit key hash.
    pub key: u64,
    /// Packed platform the change applies to; `0` for any.
    pub platform: u64,
    /// The payload.
    pub value: ChangeValue<'a>,
}

/// The value position of the map built by
/// [`map_all`](crate::ResourceSource::map_all): either the single change
/// for a key or the set of changes across platforms (and, for
/// all-timestamps maps, across history).
#[derive(Debug, Clone)]
pub enum ChangeSet<'a> {
    /// The key has exactly one relevant change.
    Single(ChangeView<'a>),
    /// The key has several relevant changes.
    Many(Vec<ChangeView<'a>>),
}

impl<'a> ChangeSet<'a> {
    /// Iterate the contained changes uniformly.
    pub fn iter(&self) -> std::slice::Iter<'_, ChangeView<'a>> {
        match self {
            ChangeSet::Single(one) => std::slice::from_ref(one).iter(),
            ChangeSet::Many(many) => many.iter(),
        }
    }

    /// Number of contained changes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            ChangeSet::Single(_) => 1,
            ChangeSet::Many(many) => many.len(),
        }
    }

    /// `true` when no change is contained (only possible for an empty
    /// `Many`, which `map_all` never produces).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
