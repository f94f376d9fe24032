// SPDX-License-Identifier: MIT OR Apache-2.0
//! Blob sidecar files.
//!
//! Large change payloads live out-of-line next to the source file, named
//! `<32-hex uuid>.<key-hex>.<platform-hex>.<checksum-hex>.blob`. A sidecar
//! exists while at least one change in the source references its
//! `(key, platform, checksum)` triple; [`BlobStore::clear_history`] sweeps
//! the rest.

use crate::change::ChangeValue;
use crate::source::ResourceSource;
use rp_core::{uuid_hex, uuid_path_under};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Errors from the blob sidecar store.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// Filesystem failure.
    #[error("blob i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// No sidecar for the requested triple.
    #[error("blob not found: {path}")]
    NotFound {
        /// Path that was probed.
        path: PathBuf,
    },

    /// The sidecar exists but its length is not the expected size.
    #[error("blob size mismatch: expected {expected}, found {actual}")]
    SizeMismatch {
        /// Size recorded in the change.
        expected: u64,
        /// Size of the file on disk.
        actual: u64,
    },
}

/// Parsed form of a sidecar file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidecarName {
    /// Owning resource.
    pub uuid: Uuid,
    /// Change key hash.
    pub key: u64,
    /// Packed platform.
    pub platform: u64,
    /// Payload checksum.
    pub checksum: u64,
}

impl SidecarName {
    /// The on-disk file name for this sidecar.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "{}.{:016x}.{:016x}.{:016x}.blob",
            uuid_hex(self.uuid),
            self.key,
            self.platform,
            self.checksum
        )
    }

    /// Parse a file name produced by [`file_name`](Self::file_name).
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".blob")?;
        let mut parts = stem.split('.');
        let uuid_part = parts.next()?;
        let key = u64::from_str_radix(parts.next()?, 16).ok()?;
        let platform = u64::from_str_radix(parts.next()?, 16).ok()?;
        let checksum = u64::from_str_radix(parts.next()?, 16).ok()?;
        if parts.next().is_some() || uuid_part.len() != 32 {
            return None;
        }
        let uuid = Uuid::parse_str(uuid_part).ok()?;
        Some(Self {
            uuid,
            key,
            platform,
            checksum,
        })
    }
}

/// Sidecar store rooted at a source tree.
///
/// No in-memory caching: every call goes to the filesystem.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// A store over the given source root.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The source file path for a resource under this root.
    #[must_use]
    pub fn source_path(&self, uuid: Uuid) -> PathBuf {
        uuid_path_under(&self.root, uuid)
    }

    /// The sidecar path for a `(key, platform, checksum)` triple.
    #[must_use]
    pub fn sidecar_path(&self, uuid: Uuid, key: u64, platform: u64, checksum: u64) -> PathBuf {
        let name = SidecarName {
            uuid,
            key,
            platform,
            checksum,
        };
        self.source_dir(uuid).join(name.file_name())
    }

    fn source_dir(&self, uuid: Uuid) -> PathBuf {
        let mut dir = self.source_path(uuid);
        dir.pop();
        dir
    }

    /// Write a sidecar, creating parent directories on demand.
    pub fn write(
        &self,
        uuid: Uuid,
        key: u64,
        platform: u64,
        checksum: u64,
        bytes: &[u8],
    ) -> Result<PathBuf, BlobError> {
        let path = self.sidecar_path(uuid, key, platform, checksum);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Read a sidecar whose size must match `expected_size` exactly.
    pub fn read(
        &self,
        uuid: Uuid,
        key: u64,
        platform: u64,
        checksum: u64,
        expected_size: u64,
    ) -> Result<Vec<u8>, BlobError> {
        let path = self.sidecar_path(uuid, key, platform, checksum);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound { path });
            }
            Err(err) => return Err(err.into()),
        };
        if bytes.len() as u64 != expected_size {
            return Err(BlobError::SizeMismatch {
                expected: expected_size,
                actual: bytes.len() as u64,
            });
        }
        Ok(bytes)
    }

    /// File names of every sidecar belonging to `uuid`.
    pub fn enumerate(&self, uuid: Uuid) -> Result<Vec<String>, BlobError> {
        let dir = self.source_dir(uuid);
        let prefix = format!("{}.", uuid_hex(uuid));
        let mut names = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(".blob") {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete every sidecar of `uuid` that no change in `source` still
    /// references, returning how many files were removed.
    ///
    /// References are gathered from an all-timestamps map, so a sidecar
    /// survives as long as any historical change names its triple.
    pub fn clear_history(&self, uuid: Uuid, source: &ResourceSource) -> Result<usize, BlobError> {
        let mut referenced: HashSet<(u64, u64, u64)> = HashSet::new();
        for set in source.map_all(true).values() {
            for change in set.iter() {
                if let ChangeValue::Blob { checksum, .. } = change.value {
                    referenced.insert((change.key, change.platform, checksum));
                }
            }
        }

        let mut removed = 0;
        for name in self.enumerate(uuid)? {
            let Some(sidecar) = SidecarName::parse(&name) else {
                continue;
            };
            if referenced.contains(&(sidecar.key, sidecar.platform, sidecar.checksum)) {
                continue;
            }
            let path = self.source_dir(uuid).join(&name);
            debug!(blob = %path.display(), "removing unreferenced blob sidecar");
            fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Delete every sidecar of `uuid`, returning how many were removed.
    pub fn remove_all(&self, uuid: Uuid) -> Result<usize, BlobError> {
        let dir = self.source_dir(uuid);
        let mut removed = 0;
        for name in self.enumerate(uuid)? {
            fs::remove_file(dir.join(&name))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_name_round_trip() {
        let name = SidecarName {
            uuid: Uuid::from_u128(0xfeed_face_dead_beef_feed_face_dead_beef),
            key: 0x1234,
            platform: 5,
            checksum: 0xabcdef,
        };
        let parsed = SidecarName::parse(&name.file_name()).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn sidecar_name_rejects_foreign_files() {
        assert!(SidecarName::parse("import.map").is_none());
        assert!(SidecarName::parse("deadbeef.blob").is_none());
        assert!(SidecarName::parse("00000000000000000000000000000000.xx.yy.zz.blob").is_none());
    }

    #[test]
    fn write_read_exact_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let uuid = Uuid::new_v4();
        let payload = b"blob payload";
        let checksum = rp_core::hash64(payload);

        store.write(uuid, 7, 0, checksum, payload).unwrap();
        let read = store.read(uuid, 7, 0, checksum, payload.len() as u64).unwrap();
        assert_eq!(read, payload);

        let err = store.read(uuid, 7, 0, checksum, 3).unwrap_err();
        assert!(matches!(err, BlobError::SizeMismatch { expected: 3, .. }));
    }

    #[test]
    fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let err = store.read(Uuid::new_v4(), 1, 0, 2, 8).unwrap_err();
        assert!(matches!(err, BlobError::NotFound { .. }));
    }

    #[test]
    fn enumerate_only_own_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        store.write(a, 1, 0, 10, b"a").unwrap();
        store.write(b, 1, 0, 11, b"b").unwrap();

        let names = store.enumerate(a).unwrap();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with(&uuid_hex(a)));
    }

    #[test]
    fn clear_history_removes_unreferenced() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let uuid = Uuid::from_u128(42);

        let mut source = ResourceSource::new();
        source.set_blob(1, 9, 0, 100, 1);
        source.set_blob(2, 9, 0, 200, 1);
        store.write(uuid, 9, 0, 100, b"x").unwrap();
        store.write(uuid, 9, 0, 200, b"y").unwrap();
        store.write(uuid, 9, 0, 300, b"z").unwrap();

        let removed = store.clear_history(uuid, &source).unwrap();
        assert_eq!(removed, 1);

        // Both historical checksums survive an all-timestamps sweep.
        let names = store.enumerate(uuid).unwrap();
        assert_eq!(names.len(), 2);
        for name in names {
            let sidecar = SidecarName::parse(&name).unwrap();
            assert!(sidecar.checksum == 100 || sidecar.checksum == 200);
        }
    }
}
