// SPDX-License-Identifier: MIT OR Apache-2.0
//! The autoimport watch set.

use rp_importmap::normalize;
use std::path::{Path, PathBuf};

/// A set of watched directories kept pairwise incomparable: no watched
/// path is ever an ancestor of another. Watching a directory whose
/// ancestor is already watched is a no-op; watching an ancestor of
/// existing entries swallows them.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    dirs: Vec<PathBuf>,
}

impl WatchSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `dir` to the set. Returns `false` when an already-watched
    /// ancestor makes the new watch redundant.
    pub fn watch(&mut self, dir: &Path) -> bool {
        let dir = normalize(dir);
        if self
            .dirs
            .iter()
            .any(|watched| dir.starts_with(watched))
        {
            return false;
        }
        self.dirs.retain(|watched| !watched.starts_with(&dir));
        self.dirs.push(dir);
        true
    }

    /// Remove exactly `dir`. Returns whether it was present.
    pub fn unwatch(&mut self, dir: &Path) -> bool {
        let dir = normalize(dir);
        let before = self.dirs.len();
        self.dirs.retain(|watched| *watched != dir);
        before != self.dirs.len()
    }

    /// `true` when `path` lies under a watched directory.
    #[must_use]
    pub fn covers(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.dirs.iter().any(|watched| path.starts_with(watched))
    }

    /// The watched directories.
    #[must_use]
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ancestor_suppresses_descendant() {
        let mut set = WatchSet::new();
        assert!(set.watch(Path::new("/art")));
        assert!(!set.watch(Path::new("/art/textures")));
        assert_eq!(set.dirs().len(), 1);
        assert!(set.covers(Path::new("/art/textures/stone.png")));
    }

    #[test]
    fn ancestor_swallows_existing_descendants() {
        let mut set = WatchSet::new();
        set.watch(Path::new("/art/textures"));
        set.watch(Path::new("/art/models"));
        set.watch(Path::new("/sounds"));
        assert!(set.watch(Path::new("/art")));

        let dirs = set.dirs();
        assert_eq!(dirs.len(), 2);
        assert!(dirs.contains(&PathBuf::from("/art")));
        assert!(dirs.contains(&PathBuf::from("/sounds")));
    }

    #[test]
    fn unwatch_removes_exact_entry_only() {
        let mut set = WatchSet::new();
        set.watch(Path::new("/art"));
        assert!(!set.unwatch(Path::new("/art/textures")));
        assert!(set.unwatch(Path::new("/art")));
        assert!(!set.covers(Path::new("/art/x.png")));
    }

    #[test]
    fn sibling_prefix_names_are_unrelated() {
        let mut set = WatchSet::new();
        set.watch(Path::new("/art"));
        // "/artwork" shares a string prefix but is not a descendant.
        assert!(set.watch(Path::new("/artwork")));
        assert_eq!(set.dirs().len(), 2);
    }

    fn arb_dir() -> impl Strategy<Value = PathBuf> {
        proptest::collection::vec("[a-c]", 1..4)
            .prop_map(|parts| PathBuf::from(format!("/{}", parts.join("/"))))
    }

    proptest! {
        // After any watch/unwatch sequence, no watched path is a prefix
        // of another.
        #[test]
        fn watch_set_stays_minimal(
            ops in proptest::collection::vec((arb_dir(), any::<bool>()), 0..30)
        ) {
            let mut set = WatchSet::new();
            for (dir, is_watch) in ops {
                if is_watch {
                    set.watch(&dir);
                } else {
                    set.unwatch(&dir);
                }
            }
            let dirs = set.dirs();
            for a in dirs {
                for b in dirs {
                    if a != b {
                        prop_assert!(!a.starts_with(b));
                    }
                }
            }
        }
    }
}
