// SPDX-License-Identifier: MIT OR Apache-2.0
//! Directory-hashed local cache of compiled artifacts.
//!
//! Compiled output for `(uuid, platform)` is stored at
//! `<root>/aa/bb/<32-hex uuid>/<decimal platform>`, with a `.blob` suffix
//! for the dynamic portion. Lookups walk each configured root in order,
//! reducing the requested platform step by step until an artifact is
//! found, so the closest compiled specialization serves a more specific
//! request.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rp_core::{uuid_path_under, ContentHash};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::trace;
use uuid::Uuid;

/// Errors from the local artifact cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Filesystem failure.
    #[error("cache i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// An artifact file is shorter than the fixed header.
    #[error("artifact header truncated at {path}")]
    HeaderTruncated {
        /// The artifact path.
        path: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Artifact header
// ---------------------------------------------------------------------------

/// Size in bytes of the fixed artifact header.
pub const HEADER_SIZE: usize = 8 + 4 + 32;

/// Current artifact format version, stamped into every header.
pub const ARTIFACT_VERSION: u32 = 1;

/// The fixed little-endian header opening every compiled artifact:
/// `u64 type; u32 version; u256 source_hash`.
///
/// The embedded source hash is what makes a compiled file self-describing
/// for freshness checks: an artifact is current exactly when this hash
/// matches the current source hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactHeader {
    /// 64-bit hash of the resource type name.
    pub type_hash: u64,
    /// Artifact format version.
    pub version: u32,
    /// Content hash of the source the artifact was compiled from.
    pub source_hash: ContentHash,
}

impl ArtifactHeader {
    /// A header for the current format version.
    #[must_use]
    pub fn new(type_hash: u64, source_hash: ContentHash) -> Self {
        Self {
            type_hash,
            version: ARTIFACT_VERSION,
            source_hash,
        }
    }

    /// Serialize to the fixed wire layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&self.type_hash.to_le_bytes());
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..44].copy_from_slice(self.source_hash.as_bytes());
        out
    }

    /// Parse the fixed wire layout.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let type_hash = u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes"));
        let version = u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes"));
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[12..44]);
        Self {
            type_hash,
            version,
            source_hash: ContentHash::from_bytes(hash),
        }
    }

    /// Write the header to a stream.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// Read a header from the start of `path`.
    pub fn read_from_file(path: &Path) -> Result<Self, CacheError> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut buf).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                CacheError::HeaderTruncated {
                    path: path.to_path_buf(),
                }
            } else {
                CacheError::Io(err)
            }
        })?;
        Ok(Self::from_bytes(&buf))
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// An artifact opened through the fallback walk.
#[derive(Debug)]
pub struct CachedArtifact {
    /// The opened file, positioned at byte 0.
    pub file: File,
    /// The artifact path.
    pub path: PathBuf,
    /// The platform the served artifact was compiled for; equal to or less
    /// specific than the requested platform.
    pub platform: u64,
    /// Total file size in bytes, header included.
    pub size: u64,
}

/// Multi-root local artifact cache.
#[derive(Debug, Clone, Default)]
pub struct LocalCache {
    roots: Vec<PathBuf>,
}

impl LocalCache {
    /// A cache over the given roots, searched in order.
    #[must_use]
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Append a search root.
    pub fn add_root(&mut self, root: impl Into<PathBuf>) {
        self.roots.push(root.into());
    }

    /// The configured roots.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Artifact path for `(uuid, platform)` under a specific root.
    #[must_use]
    pub fn artifact_path(root: &Path, uuid: Uuid, platform: u64, dynamic: bool) -> PathBuf {
        let mut path = uuid_path_under(root, uuid);
        if dynamic {
            path.push(format!("{platform}.blob"));
        } else {
            path.push(platform.to_string());
        }
        path
    }

    /// Find the most specific existing artifact for `(uuid, platform)`.
    ///
    /// Each root is searched in order; within a root the platform is
    /// reduced step by step toward the any-platform until a file exists.
    #[must_use]
    pub fn locate(&self, uuid: Uuid, platform: u64, dynamic: bool) -> Option<(PathBuf, u64)> {
        for root in &self.roots {
            let mut current = platform;
            loop {
                let candidate = Self::artifact_path(root, uuid, current, dynamic);
                if candidate.is_file() {
                    trace!(path = %candidate.display(), requested = platform, served = current,
                        "located cached artifact");
                    return Some((candidate, current));
                }
                if current == rp_platform::PLATFORM_ANY {
                    break;
                }
                current = rp_platform::reduce(current, platform);
            }
        }
        None
    }

    /// Open the static artifact for `(uuid, platform)`, reducing the
    /// platform as needed. `None` when no root has any applicable file.
    pub fn open_static(&self, uuid: Uuid, platform: u64) -> Result<Option<CachedArtifact>, CacheError> {
        self.open(uuid, platform, false)
    }

    /// Open the dynamic (`.blob`) artifact for `(uuid, platform)`.
    pub fn open_dynamic(&self, uuid: Uuid, platform: u64) -> Result<Option<CachedArtifact>, CacheError> {
        self.open(uuid, platform, true)
    }

    fn open(
        &self,
        uuid: Uuid,
        platform: u64,
        dynamic: bool,
    ) -> Result<Option<CachedArtifact>, CacheError> {
        let Some((path, served)) = self.locate(uuid, platform, dynamic) else {
            return Ok(None);
        };
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        Ok(Some(CachedArtifact {
            file,
            path,
            platform: served,
            size,
        }))
    }

    /// Create (truncating) the static artifact file in the first root,
    /// making intermediate directories as needed.
    pub fn create_static(&self, uuid: Uuid, platform: u64) -> Result<File, CacheError> {
        self.create(uuid, platform, false)
    }

    /// Create (truncating) the dynamic artifact file in the first root.
    pub fn create_dynamic(&self, uuid: Uuid, platform: u64) -> Result<File, CacheError> {
        self.create(uuid, platform, true)
    }

    fn create(&self, uuid: Uuid, platform: u64, dynamic: bool) -> Result<File, CacheError> {
        let root = self.roots.first().cloned().unwrap_or_else(|| PathBuf::from("."));
        let path = Self::artifact_path(&root, uuid, platform, dynamic);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?)
    }

    /// Remove every artifact of `uuid` across all roots. Used by resource
    /// deletion; missing directories are not an error.
    pub fn remove_all(&self, uuid: Uuid) -> Result<(), CacheError> {
        for root in &self.roots {
            let dir = uuid_path_under(root, uuid);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_platform::PlatformSpec;

    fn platform(base: Option<u8>, custom: Option<u8>) -> u64 {
        PlatformSpec {
            base,
            custom,
            ..PlatformSpec::ANY
        }
        .pack()
        .unwrap()
    }

    #[test]
    fn header_round_trip() {
        let header = ArtifactHeader::new(rp_core::hash64(b"texture"), ContentHash::of(b"src"));
        let parsed = ArtifactHeader::from_bytes(&header.to_bytes());
        assert_eq!(parsed, header);
        assert_eq!(parsed.version, ARTIFACT_VERSION);
    }

    #[test]
    fn create_then_open_exact_platform() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(vec![dir.path().to_path_buf()]);
        let uuid = Uuid::new_v4();
        let p = platform(Some(1), None);

        let mut file = cache.create_static(uuid, p).unwrap();
        file.write_all(b"artifact").unwrap();
        drop(file);

        let opened = cache.open_static(uuid, p).unwrap().unwrap();
        assert_eq!(opened.platform, p);
        assert_eq!(opened.size, 8);
    }

    #[test]
    fn open_falls_back_to_less_specific_platform() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(vec![dir.path().to_path_buf()]);
        let uuid = Uuid::new_v4();
        let base_only = platform(Some(1), None);
        let specific = platform(Some(1), Some(9));

        cache.create_static(uuid, base_only).unwrap();
        let opened = cache.open_static(uuid, specific).unwrap().unwrap();
        assert_eq!(opened.platform, base_only);

        // A request for an unrelated base finds nothing.
        assert!(cache.open_static(uuid, platform(Some(2), None)).unwrap().is_none());
    }

    #[test]
    fn roots_are_searched_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(vec![first.path().to_path_buf(), second.path().to_path_buf()]);
        let uuid = Uuid::new_v4();

        // Artifact only in the second root; the first root walks its whole
        // fallback chain before the second root is consulted.
        let fallback = LocalCache::new(vec![second.path().to_path_buf()]);
        fallback.create_static(uuid, 0).unwrap();
        let opened = cache.open_static(uuid, platform(Some(3), None)).unwrap().unwrap();
        assert_eq!(opened.platform, 0);
        assert!(opened.path.starts_with(second.path()));
    }

    #[test]
    fn dynamic_uses_blob_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(vec![dir.path().to_path_buf()]);
        let uuid = Uuid::new_v4();
        cache.create_dynamic(uuid, 5).unwrap();

        let (path, _) = cache.locate(uuid, 5, true).unwrap();
        assert!(path.to_string_lossy().ends_with("5.blob"));
        assert!(cache.locate(uuid, 5, false).is_none());
    }

    #[test]
    fn header_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(vec![dir.path().to_path_buf()]);
        let uuid = Uuid::new_v4();
        let header = ArtifactHeader::new(7, ContentHash::of(b"s"));

        let mut file = cache.create_static(uuid, 0).unwrap();
        header.write_to(&mut file).unwrap();
        file.write_all(b"body").unwrap();
        drop(file);

        let (path, _) = cache.locate(uuid, 0, false).unwrap();
        assert_eq!(ArtifactHeader::read_from_file(&path).unwrap(), header);

        std::fs::write(&path, b"tiny").unwrap();
        assert!(matches!(
            ArtifactHeader::read_from_file(&path),
            Err(CacheError::HeaderTruncated { .. })
        ));
    }
}
