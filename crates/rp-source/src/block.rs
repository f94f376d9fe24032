// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fixed-capacity change blocks with arena-backed value storage.

use crate::change::{Change, ChangePayload, ChangeValue, ChangeView, ValueRef};

/// Changes per block before a new block is chained.
pub(crate) const BLOCK_CAPACITY: usize = 32;

/// Size of the initial arena page of each block; overflow pages are sized
/// `max(PAGE_CAPACITY, requested)`.
pub(crate) const PAGE_CAPACITY: usize = 1024;

/// One arena page. The buffer's capacity is fixed at allocation; interning
/// never grows a page past it, so value offsets stay stable.
#[derive(Debug)]
struct ArenaPage {
    buf: Vec<u8>,
}

impl ArenaPage {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn remaining(&self) -> usize {
        self.buf.capacity() - self.buf.len()
    }
}

/// A fixed-capacity run of changes plus the arena pages owning their value
/// bytes. Value bytes never move to a different block than their change.
#[derive(Debug)]
pub(crate) struct ChangeBlock {
    changes: Vec<Change>,
    pages: Vec<ArenaPage>,
}

impl ChangeBlock {
    pub(crate) fn new() -> Self {
        Self {
            changes: Vec::with_capacity(BLOCK_CAPACITY),
            pages: vec![ArenaPage::with_capacity(PAGE_CAPACITY)],
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.changes.len() >= BLOCK_CAPACITY
    }

    pub(crate) fn len(&self) -> usize {
        self.changes.len()
    }

    /// Copy `bytes` into this block's arena, walking the page chain for a
    /// page with room and allocating an overflow page if none fits.
    pub(crate) fn intern(&mut self, bytes: &[u8]) -> ValueRef {
        let page = match self.pages.iter().position(|p| p.remaining() >= bytes.len()) {
            Some(idx) => idx,
            None => {
                self.pages
                    .push(ArenaPage::with_capacity(PAGE_CAPACITY.max(bytes.len())));
                self.pages.len() - 1
            }
        };
        let buf = &mut self.pages[page].buf;
        let offset = buf.len();
        buf.extend_from_slice(bytes);
        ValueRef {
            page: page as u32,
            offset: offset as u32,
            len: bytes.len() as u32,
        }
    }

    pub(crate) fn push(&mut self, change: Change) {
        debug_assert!(!self.is_full());
        self.changes.push(change);
    }

    fn value_bytes(&self, value: ValueRef) -> &[u8] {
        let start = value.offset as usize;
        &self.pages[value.page as usize].buf[start..start + value.len as usize]
    }

    fn view(&self, change: &Change) -> ChangeView<'_> {
        let value = match change.payload {
            ChangePayload::Value(v) => ChangeValue::Value(self.value_bytes(v)),
            ChangePayload::Blob { checksum, size } => ChangeValue::Blob { checksum, size },
            ChangePayload::Unset => ChangeValue::Unset,
        };
        ChangeView {
            timestamp: change.timestamp,
            key: change.key,
            platform: change.platform,
            value,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = ChangeView<'_>> {
        self.changes.iter().map(|c| self.view(c))
    }
}
