// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `import.map` path index.
//!
//! An import map is a plain-text file binding imported file paths to
//! `(UUID, signature-hash)` pairs. Lines are fixed-column so that the only
//! mutable field, the signature, can be rewritten in place without moving
//! the UUID or path columns:
//!
//! ```text
//! offset 0   16-hex FNV-1a hash of the stored sub-path
//! offset 17  36-char lower-case hyphenated UUID
//! offset 54  64-hex signature (content hash at import time)
//! offset 119 sub-path, terminated by LF
//! ```
//!
//! Paths are stored relative to the map's own directory, which is why the
//! index survives renames of any ancestor above it. New entries are
//! appended; removal blanks the line in place, and readers skip anything
//! that does not parse.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rp_core::{hash64, ContentHash};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, trace};
use uuid::Uuid;

/// File name of the index within a source tree.
pub const MAP_FILE_NAME: &str = "import.map";

const COL_UUID: usize = 17;
const COL_SIGNATURE: usize = 54;
const COL_PATH: usize = 119;
/// A valid line holds all columns plus at least one path byte.
const MIN_LINE: usize = COL_PATH + 1;

/// Errors from import-map operations.
#[derive(Debug, thiserror::Error)]
pub enum ImportMapError {
    /// Filesystem failure.
    #[error("import map i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// The path cannot be stored in a line-oriented index.
    #[error("path contains CR or LF and cannot be stored: {path}")]
    UnstorablePath {
        /// The offending path.
        path: String,
    },
}

/// One parsed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportMapEntry {
    /// Resource UUID.
    pub uuid: Uuid,
    /// Signature hash recorded at import time.
    pub signature: ContentHash,
    /// Path as stored (relative to the map directory when possible).
    pub stored_path: String,
}

/// An opened `import.map`.
#[derive(Debug, Clone)]
pub struct ImportMap {
    file: PathBuf,
    dir: PathBuf,
}

impl ImportMap {
    /// Locate the map governing `path`.
    ///
    /// Walks from the path's directory upward until an existing
    /// [`MAP_FILE_NAME`] is found. When none exists and `write` is set, a
    /// fresh empty map is created next to `path`; otherwise `None` is
    /// returned.
    pub fn open(path: &Path, write: bool) -> Result<Option<ImportMap>, ImportMapError> {
        let normalized = normalize(path);
        let start = normalized.parent().unwrap_or(&normalized).to_path_buf();

        let mut dir = start.clone();
        loop {
            let candidate = dir.join(MAP_FILE_NAME);
            if candidate.is_file() {
                trace!(map = %candidate.display(), "found import map");
                return Ok(Some(ImportMap {
                    file: candidate,
                    dir,
                }));
            }
            if !dir.pop() {
                break;
            }
        }

        if !write {
            return Ok(None);
        }
        fs::create_dir_all(&start)?;
        let file = start.join(MAP_FILE_NAME);
        fs::write(&file, b"")?;
        debug!(map = %file.display(), "created import map");
        Ok(Some(ImportMap { file, dir: start }))
    }

    /// The map file itself.
    #[must_use]
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// The directory entries are stored relative to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The sub-path under which `path` is indexed: relative to the map
    /// directory when it lies inside it, the full normalized path
    /// otherwise.
    #[must_use]
    pub fn sub_path(&self, path: &Path) -> String {
        let normalized = normalize(path);
        let sub = normalized
            .strip_prefix(&self.dir)
            .unwrap_or(&normalized);
        path_str(sub)
    }

    /// Look up the entry for `path`.
    pub fn lookup(&self, path: &Path) -> Result<Option<ImportMapEntry>, ImportMapError> {
        let sub = self.sub_path(path);
        let wanted = hash64(sub.as_bytes());
        let data = fs::read(&self.file)?;
        Ok(scan(&data, |line| {
            let parsed = parse_line(line)?;
            // Hash first, full path compare to resolve collisions.
            (parsed.0 == wanted && parsed.3.stored_path == sub).then_some(parsed.3)
        })
        .map(|(_, entry)| entry))
    }

    /// Find the stored path for `uuid`, resolved against the map
    /// directory.
    pub fn reverse_lookup(&self, uuid: Uuid) -> Result<Option<PathBuf>, ImportMapError> {
        let data = fs::read(&self.file)?;
        Ok(scan(&data, |line| {
            let parsed = parse_line(line)?;
            (parsed.3.uuid == uuid).then_some(parsed.3)
        })
        .map(|(_, entry)| self.resolve(&entry.stored_path)))
    }

    /// Resolve a stored sub-path to an absolute path.
    #[must_use]
    pub fn resolve(&self, stored_path: &str) -> PathBuf {
        let p = Path::new(stored_path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.dir.join(p)
        }
    }

    /// Record `path → (uuid, signature)`.
    ///
    /// An existing line for the path keeps its UUID; only the signature
    /// column is rewritten, in place. A new path is appended. Returns the
    /// UUID now stored for the path.
    pub fn store(
        &self,
        path: &Path,
        uuid: Uuid,
        signature: ContentHash,
    ) -> Result<Uuid, ImportMapError> {
        let sub = self.sub_path(path);
        if sub.contains('\r') || sub.contains('\n') {
            return Err(ImportMapError::UnstorablePath { path: sub });
        }
        let wanted = hash64(sub.as_bytes());

        let data = fs::read(&self.file)?;
        let existing = scan(&data, |line| {
            let parsed = parse_line(line)?;
            (parsed.0 == wanted && parsed.3.stored_path == sub).then_some(parsed.3)
        });

        if let Some((offset, entry)) = existing {
            let mut file = OpenOptions::new().read(true).write(true).open(&self.file)?;
            file.seek(SeekFrom::Start((offset + COL_SIGNATURE) as u64))?;
            file.write_all(signature.to_hex().as_bytes())?;
            debug!(path = %sub, uuid = %entry.uuid, "updated import map signature");
            return Ok(entry.uuid);
        }

        let line = format!("{wanted:016x} {uuid} {signature} {sub}\n");
        debug_assert!(line.len() > MIN_LINE);
        let mut file = OpenOptions::new().append(true).open(&self.file)?;
        file.write_all(line.as_bytes())?;
        debug!(path = %sub, %uuid, "appended import map entry");
        Ok(uuid)
    }

    /// Blank the line for `path`, keeping every other line's offset
    /// untouched. Blanked lines are skipped by readers.
    pub fn remove(&self, path: &Path) -> Result<bool, ImportMapError> {
        let sub = self.sub_path(path);
        let wanted = hash64(sub.as_bytes());
        let data = fs::read(&self.file)?;
        let Some((offset, _)) = scan(&data, |line| {
            let parsed = parse_line(line)?;
            (parsed.0 == wanted && parsed.3.stored_path == sub).then_some(parsed.3)
        }) else {
            return Ok(false);
        };

        let line_len = data[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(data.len() - offset);
        let mut file = OpenOptions::new().read(true).write(true).open(&self.file)?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(&vec![b' '; line_len])?;
        Ok(true)
    }

    /// Every parsable entry in the map, in file order.
    pub fn entries(&self) -> Result<Vec<ImportMapEntry>, ImportMapError> {
        let data = fs::read(&self.file)?;
        let mut out = Vec::new();
        for_each_line(&data, |_, line| {
            if let Some((_, _, _, entry)) = parse_line(line) {
                out.push(entry);
            }
            false
        });
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Line scanning
// ---------------------------------------------------------------------------

/// Call `f` for each line until it returns a value; yields the byte offset
/// of the matching line start.
fn scan<T>(data: &[u8], mut f: impl FnMut(&str) -> Option<T>) -> Option<(usize, T)> {
    let mut found = None;
    for_each_line(data, |offset, line| {
        if let Some(value) = f(line) {
            found = Some((offset, value));
            true
        } else {
            false
        }
    });
    found
}

fn for_each_line(data: &[u8], mut f: impl FnMut(usize, &str) -> bool) {
    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        let len = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
        let mut line = &rest[..len];
        // Tolerate CR+LF producers.
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        if line.len() >= MIN_LINE {
            if let Ok(line) = std::str::from_utf8(line) {
                if f(offset, line) {
                    return;
                }
            }
        }
        offset += len + 1;
    }
}

/// Parse one line into `(path-hash, uuid-str, sig-str, entry)`.
/// Returns `None` for blanked or malformed lines.
#[allow(clippy::type_complexity)]
fn parse_line(line: &str) -> Option<(u64, &str, &str, ImportMapEntry)> {
    let hash = u64::from_str_radix(line.get(0..16)?, 16).ok()?;
    let uuid_str = line.get(COL_UUID..COL_UUID + 36)?;
    let sig_str = line.get(COL_SIGNATURE..COL_SIGNATURE + 64)?;
    let stored_path = line.get(COL_PATH..)?;
    let uuid = Uuid::try_parse(uuid_str).ok()?;
    let signature: ContentHash = sig_str.parse().ok()?;
    Some((
        hash,
        uuid_str,
        sig_str,
        ImportMapEntry {
            uuid,
            signature,
            stored_path: stored_path.to_string(),
        },
    ))
}

// ---------------------------------------------------------------------------
// Path normalization
// ---------------------------------------------------------------------------

/// Lexical normalization: absolutize against the working directory and
/// fold `.` / `..` components without touching the filesystem.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sig(n: u8) -> ContentHash {
        ContentHash::of(&[n])
    }

    fn map_in(dir: &TempDir) -> ImportMap {
        let asset = dir.path().join("textures/stone.png");
        ImportMap::open(&asset, true).unwrap().unwrap()
    }

    #[test]
    fn open_creates_map_next_to_file_when_writing() {
        let dir = TempDir::new().unwrap();
        let asset = dir.path().join("models/chair.obj");

        assert!(ImportMap::open(&asset, false).unwrap().is_none());
        let map = ImportMap::open(&asset, true).unwrap().unwrap();
        assert!(map.file().is_file());
        assert_eq!(map.dir(), dir.path().join("models"));
    }

    #[test]
    fn open_walks_up_to_existing_map() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MAP_FILE_NAME), b"").unwrap();
        let nested = dir.path().join("a/b/c/mesh.fbx");
        fs::create_dir_all(nested.parent().unwrap()).unwrap();

        let map = ImportMap::open(&nested, true).unwrap().unwrap();
        assert_eq!(map.dir(), dir.path());
        assert_eq!(map.sub_path(&nested), "a/b/c/mesh.fbx");
    }

    #[test]
    fn lookup_on_empty_map_is_none() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        let asset = dir.path().join("textures/stone.png");
        assert!(map.lookup(&asset).unwrap().is_none());
    }

    #[test]
    fn store_then_lookup_round_trip() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        let asset = dir.path().join("textures/stone.png");
        let uuid = Uuid::new_v4();

        let stored = map.store(&asset, uuid, sig(1)).unwrap();
        assert_eq!(stored, uuid);

        let entry = map.lookup(&asset).unwrap().unwrap();
        assert_eq!(entry.uuid, uuid);
        assert_eq!(entry.signature, sig(1));
    }

    #[test]
    fn restore_updates_signature_keeps_uuid() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        let asset = dir.path().join("textures/stone.png");
        let original = Uuid::new_v4();

        map.store(&asset, original, sig(1)).unwrap();
        let len_before = fs::metadata(map.file()).unwrap().len();

        // A second store with a different UUID must keep the original.
        let returned = map.store(&asset, Uuid::new_v4(), sig(2)).unwrap();
        assert_eq!(returned, original);

        let entry = map.lookup(&asset).unwrap().unwrap();
        assert_eq!(entry.uuid, original);
        assert_eq!(entry.signature, sig(2));
        // In-place update: the file did not grow.
        assert_eq!(fs::metadata(map.file()).unwrap().len(), len_before);
    }

    #[test]
    fn reverse_lookup_resolves_against_map_dir() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        let asset = dir.path().join("textures/stone.png");
        let uuid = Uuid::new_v4();
        map.store(&asset, uuid, sig(3)).unwrap();

        let resolved = map.reverse_lookup(uuid).unwrap().unwrap();
        assert_eq!(resolved, normalize(&asset));
        assert!(map.reverse_lookup(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn crlf_lines_parse() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        let asset = dir.path().join("textures/stone.png");
        let uuid = Uuid::new_v4();
        map.store(&asset, uuid, sig(4)).unwrap();

        // Rewrite the file with CR+LF endings, as a Windows editor would.
        let text = fs::read_to_string(map.file()).unwrap();
        fs::write(map.file(), text.replace('\n', "\r\n")).unwrap();

        assert_eq!(map.lookup(&asset).unwrap().unwrap().uuid, uuid);
    }

    #[test]
    fn paths_outside_map_dir_store_full_path() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let map = map_in(&dir);
        let foreign = outside.path().join("loose.wav");
        let uuid = Uuid::new_v4();

        map.store(&foreign, uuid, sig(5)).unwrap();
        let entry = map.lookup(&foreign).unwrap().unwrap();
        assert!(Path::new(&entry.stored_path).is_absolute());
        assert_eq!(map.resolve(&entry.stored_path), normalize(&foreign));
    }

    #[test]
    fn newline_paths_are_rejected() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        let bad = dir.path().join("bad\nname.png");
        let err = map.store(&bad, Uuid::new_v4(), sig(6)).unwrap_err();
        assert!(matches!(err, ImportMapError::UnstorablePath { .. }));
    }

    #[test]
    fn remove_blanks_line_in_place() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        let a = dir.path().join("textures/a.png");
        let b = dir.path().join("textures/b.png");
        let uuid_b = Uuid::new_v4();
        map.store(&a, Uuid::new_v4(), sig(7)).unwrap();
        map.store(&b, uuid_b, sig(8)).unwrap();
        let len_before = fs::metadata(map.file()).unwrap().len();

        assert!(map.remove(&a).unwrap());
        assert!(!map.remove(&a).unwrap());

        assert_eq!(fs::metadata(map.file()).unwrap().len(), len_before);
        assert!(map.lookup(&a).unwrap().is_none());
        assert_eq!(map.lookup(&b).unwrap().unwrap().uuid, uuid_b);
        assert_eq!(map.entries().unwrap().len(), 1);
    }

    #[test]
    fn short_and_garbage_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        let asset = dir.path().join("textures/stone.png");
        let uuid = Uuid::new_v4();

        fs::write(map.file(), b"short line\n").unwrap();
        map.store(&asset, uuid, sig(9)).unwrap();
        assert_eq!(map.lookup(&asset).unwrap().unwrap().uuid, uuid);
    }
}
