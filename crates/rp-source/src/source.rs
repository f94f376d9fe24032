// SPDX-License-Identifier: MIT OR Apache-2.0
//! The resource source: an append-only change log with map/reduce
//! traversal, platform-aware lookup, and history collapse.

use crate::block::ChangeBlock;
use crate::change::{Change, ChangePayload, ChangeSet, ChangeValue, ChangeView};
use std::collections::HashMap;
use std::ops::ControlFlow;

/// Lifecycle of a source between construction and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Freshly constructed, no changes.
    Empty,
    /// Populated from disk and unmodified since.
    Loaded,
    /// Has changes not yet written back.
    Modified,
    /// Written to disk and unmodified since.
    Written,
}

/// An append-only, timestamped key-value change log for one resource.
///
/// Changes live in a chain of fixed-capacity blocks; value bytes are
/// interned into the arena pages of the block holding their change.
/// Appends must carry non-decreasing timestamps; the log never reorders.
#[derive(Debug)]
pub struct ResourceSource {
    blocks: Vec<ChangeBlock>,
    state: SourceState,
    loaded_format: Option<crate::io::SourceFormat>,
}

impl ResourceSource {
    /// An empty source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: vec![ChangeBlock::new()],
            state: SourceState::Empty,
            loaded_format: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SourceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SourceState) {
        self.state = state;
    }

    /// The on-disk format this source was decoded from, when it was.
    #[must_use]
    pub fn loaded_format(&self) -> Option<crate::io::SourceFormat> {
        self.loaded_format
    }

    pub(crate) fn set_loaded_format(&mut self, format: crate::io::SourceFormat) {
        self.loaded_format = Some(format);
    }

    /// Total number of change records in the log.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.blocks.iter().map(ChangeBlock::len).sum()
    }

    /// `true` when no change has ever been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.change_count() == 0
    }

    /// The newest timestamp in the log, if any.
    #[must_use]
    pub fn newest_timestamp(&self) -> Option<i64> {
        self.iter().map(|c| c.timestamp).max()
    }

    /// Iterate every change in append order.
    pub fn iter(&self) -> impl Iterator<Item = ChangeView<'_>> {
        self.blocks.iter().flat_map(ChangeBlock::iter)
    }

    fn tail(&mut self) -> &mut ChangeBlock {
        if self.blocks.last().map_or(true, ChangeBlock::is_full) {
            self.blocks.push(ChangeBlock::new());
        }
        self.blocks.last_mut().expect("tail block exists")
    }

    fn append(&mut self, change: Change) {
        self.tail().push(change);
        self.state = SourceState::Modified;
    }

    /// Append a value change. The bytes are copied into the arena of the
    /// block receiving the change, never into a different block.
    pub fn set(&mut self, timestamp: i64, key: u64, platform: u64, value: &[u8]) {
        let block = self.tail();
        let interned = block.intern(value);
        block.push(Change {
            timestamp,
            key,
            platform,
            payload: ChangePayload::Value(interned),
        });
        self.state = SourceState::Modified;
    }

    /// Append a blob change; the payload lives in a sidecar file keyed by
    /// `checksum` (see [`BlobStore`](crate::BlobStore)).
    pub fn set_blob(&mut self, timestamp: i64, key: u64, platform: u64, checksum: u64, size: u64) {
        self.append(Change {
            timestamp,
            key,
            platform,
            payload: ChangePayload::Blob { checksum, size },
        });
    }

    /// Append an unset marker removing `key` for `platform` as of
    /// `timestamp`.
    pub fn unset(&mut self, timestamp: i64, key: u64, platform: u64) {
        self.append(Change {
            timestamp,
            key,
            platform,
            payload: ChangePayload::Unset,
        });
    }

    pub(crate) fn append_loaded(&mut self, change: OwnedChange) {
        let block = self.tail();
        let payload = match change.payload {
            OwnedPayload::Value(bytes) => ChangePayload::Value(block.intern(&bytes)),
            OwnedPayload::Blob { checksum, size } => ChangePayload::Blob { checksum, size },
            OwnedPayload::Unset => ChangePayload::Unset,
        };
        block.push(Change {
            timestamp: change.timestamp,
            key: change.key,
            platform: change.platform,
            payload,
        });
    }

    // -----------------------------------------------------------------
    // Map / reduce
    // -----------------------------------------------------------------

    /// Build a `key → changes` map.
    ///
    /// With `all_timestamps` false, only the newest change per
    /// `(key, platform)` is retained; with it true, the full history per
    /// key is kept. A key maps to [`ChangeSet::Single`] when exactly one
    /// change is relevant and [`ChangeSet::Many`] otherwise.
    #[must_use]
    pub fn map_all(&self, all_timestamps: bool) -> HashMap<u64, ChangeSet<'_>> {
        let mut buckets: HashMap<u64, Vec<ChangeView<'_>>> = HashMap::new();
        for view in self.iter() {
            let bucket = buckets.entry(view.key).or_default();
            if all_timestamps {
                bucket.push(view);
            } else if let Some(existing) =
                bucket.iter_mut().find(|c| c.platform == view.platform)
            {
                // Append order is timestamp order; the later change wins.
                *existing = view;
            } else {
                bucket.push(view);
            }
        }
        buckets
            .into_iter()
            .map(|(key, mut views)| {
                let set = if views.len() == 1 {
                    ChangeSet::Single(views.remove(0))
                } else {
                    ChangeSet::Many(views)
                };
                (key, set)
            })
            .collect()
    }

    /// Fold over the change map, one accumulator per key.
    ///
    /// `reduce` is called for every non-unset change of every key with the
    /// key's accumulator so far; returning `ControlFlow::Break` aborts the
    /// whole traversal, keeping the results reduced up to that point.
    pub fn map_reduce<R, F>(&self, all_timestamps: bool, mut reduce: F) -> HashMap<u64, R>
    where
        F: FnMut(u64, ChangeView<'_>, Option<R>) -> ControlFlow<Option<R>, Option<R>>,
    {
        let mut out = HashMap::new();
        for (key, set) in self.map_all(all_timestamps) {
            let mut acc = None;
            for view in set.iter() {
                if view.value.is_unset() {
                    continue;
                }
                match reduce(key, *view, acc.take()) {
                    ControlFlow::Continue(next) => acc = next,
                    ControlFlow::Break(last) => {
                        if let Some(value) = last {
                            out.insert(key, value);
                        }
                        return out;
                    }
                }
            }
            if let Some(value) = acc {
                out.insert(key, value);
            }
        }
        out
    }

    /// Look up the best applicable change for `key` at `platform`.
    ///
    /// The newest change at the requested platform wins; when the platform
    /// has no change the lookup walks the
    /// [`reduce`](rp_platform::reduce) chain toward the any-platform.
    /// An unset marker at the best-matching platform hides the key, even
    /// if a less specific platform still has a value.
    #[must_use]
    pub fn get(&self, key: u64, platform: u64) -> Option<ChangeView<'_>> {
        let map = self.map_all(false);
        let set = map.get(&key)?;
        let mut current = platform;
        loop {
            if let Some(hit) = set.iter().find(|c| c.platform == current) {
                return match hit.value {
                    ChangeValue::Unset => None,
                    _ => Some(*hit),
                };
            }
            if current == rp_platform::PLATFORM_ANY {
                return None;
            }
            current = rp_platform::reduce(current, platform);
        }
    }

    // -----------------------------------------------------------------
    // Collapse
    // -----------------------------------------------------------------

    /// Replace the change chain with the per-`(key, platform)` winners.
    ///
    /// After the collapse the log holds at most one change per
    /// `(key, platform)` and no unset markers; winning value bytes are
    /// copied into the new chain's arenas. Every previously handed-out
    /// view is invalidated (the borrow checker enforces this).
    pub fn collapse_history(&mut self) {
        let mut winners: Vec<OwnedChange> = self
            .map_all(false)
            .into_values()
            .flat_map(|set| {
                set.iter()
                    .filter(|c| !c.value.is_unset())
                    .map(OwnedChange::from_view)
                    .collect::<Vec<_>>()
            })
            .collect();
        // Deterministic chain order, non-decreasing timestamps first.
        winners.sort_by_key(|c| (c.timestamp, c.key, c.platform));

        self.blocks = vec![ChangeBlock::new()];
        for change in winners {
            self.append_loaded(change);
        }
    }
}

impl Default for ResourceSource {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned change, used while re-homing records between block chains and
/// while decoding from disk.
#[derive(Debug, Clone)]
pub(crate) struct OwnedChange {
    pub(crate) timestamp: i64,
    pub(crate) key: u64,
    pub(crate) platform: u64,
    pub(crate) payload: OwnedPayload,
}

#[derive(Debug, Clone)]
pub(crate) enum OwnedPayload {
    Value(Vec<u8>),
    Blob { checksum: u64, size: u64 },
    Unset,
}

impl OwnedChange {
    fn from_view(view: &ChangeView<'_>) -> Self {
        let payload = match view.value {
            ChangeValue::Value(bytes) => OwnedPayload::Value(bytes.to_vec()),
            ChangeValue::Blob { checksum, size } => OwnedPayload::Blob { checksum, size },
            ChangeValue::Unset => OwnedPayload::Unset,
        };
        Self {
            timestamp: view.timestamp,
            key: view.key,
            platform: view.platform,
            payload,
        }
    }
}
