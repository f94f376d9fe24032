// SPDX-License-Identifier: MIT OR Apache-2.0
//! Filesystem monitoring seam.
//!
//! The engine only needs "a file appeared or changed under this
//! directory"; how that is detected is a collaborator concern. The
//! [`PollingMonitor`] here is the dependency-free default the daemon
//! uses; an inotify-style implementation can slot in behind the same
//! trait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    /// The file did not exist on the previous observation.
    Created,
    /// The file's modification time moved.
    Modified,
}

/// One observed filesystem change. Path-only; the handler re-reads
/// whatever it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    /// Affected file.
    pub path: PathBuf,
    /// Change kind.
    pub kind: FsEventKind,
}

/// Source of file created/modified events for a set of directories.
pub trait FsMonitor: Send {
    /// Collect the changes observed since the previous call.
    fn poll(&mut self) -> Vec<FsEvent>;

    /// Replace the set of monitored directories.
    fn set_dirs(&mut self, dirs: Vec<PathBuf>);
}

/// Modification-time polling monitor.
///
/// The first poll primes the baseline without reporting events, so a
/// daemon start does not re-announce every existing file.
#[derive(Debug, Default)]
pub struct PollingMonitor {
    dirs: Vec<PathBuf>,
    seen: HashMap<PathBuf, SystemTime>,
    primed: bool,
}

impl PollingMonitor {
    /// Monitor the given directories.
    #[must_use]
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            seen: HashMap::new(),
            primed: false,
        }
    }

    fn scan(&self) -> HashMap<PathBuf, SystemTime> {
        let mut state = HashMap::new();
        for dir in &self.dirs {
            for entry in WalkDir::new(dir).follow_links(false).into_iter().flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                if is_pipeline_file(entry.path()) {
                    continue;
                }
                if let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) {
                    state.insert(entry.path().to_path_buf(), modified);
                }
            }
        }
        state
    }
}

/// Files the pipeline writes itself and must not re-import.
fn is_pipeline_file(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name == rp_importmap::MAP_FILE_NAME || name.ends_with(".blob"),
        None => true,
    }
}

impl FsMonitor for PollingMonitor {
    fn poll(&mut self) -> Vec<FsEvent> {
        let state = self.scan();
        let mut events = Vec::new();
        if self.primed {
            for (path, modified) in &state {
                match self.seen.get(path) {
                    None => events.push(FsEvent {
                        path: path.clone(),
                        kind: FsEventKind::Created,
                    }),
                    Some(previous) if previous != modified => events.push(FsEvent {
                        path: path.clone(),
                        kind: FsEventKind::Modified,
                    }),
                    Some(_) => {}
                }
            }
        }
        self.seen = state;
        self.primed = true;
        events.sort_by(|a, b| a.path.cmp(&b.path));
        events
    }

    fn set_dirs(&mut self, dirs: Vec<PathBuf>) {
        self.dirs = dirs;
        // New directories prime on the next poll.
        self.primed = false;
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn first_poll_primes_without_events() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("existing.png"), b"x").unwrap();
        let mut monitor = PollingMonitor::new(vec![dir.path().to_path_buf()]);
        assert!(monitor.poll().is_empty());
    }

    #[test]
    fn new_files_are_created_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = PollingMonitor::new(vec![dir.path().to_path_buf()]);
        monitor.poll();

        fs::write(dir.path().join("fresh.png"), b"x").unwrap();
        let events = monitor.poll();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FsEventKind::Created);
        assert!(events[0].path.ends_with("fresh.png"));
        assert!(monitor.poll().is_empty());
    }

    #[test]
    fn pipeline_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = PollingMonitor::new(vec![dir.path().to_path_buf()]);
        monitor.poll();

        fs::write(dir.path().join("import.map"), b"x").unwrap();
        fs::write(dir.path().join("cafe.0.0.0.blob"), b"x").unwrap();
        assert!(monitor.poll().is_empty());
    }
}
