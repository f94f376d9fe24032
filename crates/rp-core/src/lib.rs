// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared vocabulary for the resource pipeline.
//!
//! Everything here is deliberately small and dependency-light: the 256-bit
//! [`ContentHash`], the stable 64-bit [`hash64`] used for change keys and
//! import-map path hashes, the well-known metadata keys, the on-disk UUID
//! directory layout, and the monotonic tick/token sources.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ContentHash
// ---------------------------------------------------------------------------

/// A 256-bit content hash (SHA-256), printed and parsed as 64 lower-case
/// hex digits.
///
/// The same hash value travels from the import-map signature column through
/// the source change log into the compiled artifact header, which is what
/// makes up-to-date checks possible without rebuilding anything.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// The all-zero hash, used as the wire representation of "no hash".
    pub const ZERO: ContentHash = ContentHash([0u8; 32]);

    /// Hash a byte slice.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(bytes);
        Self(h.finalize().into())
    }

    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `true` for the all-zero hash.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Lower-case 64-digit hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        use std::fmt::Write as _;
        let mut s = String::with_capacity(64);
        for b in self.0 {
            let _ = write!(s, "{b:02x}");
        }
        s
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

/// Error parsing a [`ContentHash`] from hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseHashError;

impl fmt::Display for ParseHashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("content hash must be 64 hex digits")
    }
}

impl std::error::Error for ParseHashError {}

impl FromStr for ContentHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(ParseHashError);
        }
        let mut out = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hi = hex_nibble(chunk[0]).ok_or(ParseHashError)?;
            let lo = hex_nibble(chunk[1]).ok_or(ParseHashError)?;
            out[i] = (hi << 4) | lo;
        }
        Ok(Self(out))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = ParseHashError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> String {
        h.to_hex()
    }
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Incremental SHA-256 hasher producing a [`ContentHash`].
#[derive(Default)]
pub struct ContentHasher(Sha256);

impl ContentHasher {
    /// Start a fresh hash.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    /// Finish and return the digest.
    #[must_use]
    pub fn finish(self) -> ContentHash {
        ContentHash(self.0.finalize().into())
    }
}

// ---------------------------------------------------------------------------
// 64-bit key hashing
// ---------------------------------------------------------------------------

/// FNV-1a 64-bit hash of a byte string.
///
/// Stable across processes and platforms; used for change keys and for the
/// path-hash column of the import map. Not a cryptographic hash — collisions
/// are resolved by the callers (full-path compare in the import map).
#[must_use]
pub const fn hash64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    hash
}

/// Key under which a source records its resource type.
pub const KEY_RESOURCE_TYPE: u64 = hash64(b"resource_type");

/// Key under which a source records its direct dependencies.
///
/// The value is a space-separated list of `<uuid>` or
/// `<uuid>@<platform-decimal>` tokens.
pub const KEY_DEPENDENCIES: u64 = hash64(b"dependencies");

/// Key under which a source records the content hash of the file it was
/// imported from, as 64 hex digits.
pub const KEY_IMPORT_HASH: u64 = hash64(b"import_hash");

// ---------------------------------------------------------------------------
// UUID directory layout
// ---------------------------------------------------------------------------

/// The 32-digit lower-case hex form of a UUID (no hyphens), used for
/// on-disk paths.
#[must_use]
pub fn uuid_hex(uuid: Uuid) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(32);
    for b in uuid.as_bytes() {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Relative directory-hashed path for a UUID: `aa/bb/<32-hex>`.
///
/// The two leading components are the first two byte pairs of the hex form,
/// keeping any single directory from accumulating every resource.
#[must_use]
pub fn uuid_path(uuid: Uuid) -> PathBuf {
    let hex = uuid_hex(uuid);
    let mut p = PathBuf::with_capacity(38);
    p.push(&hex[0..2]);
    p.push(&hex[2..4]);
    p.push(&hex);
    p
}

/// `uuid_path` anchored under a root directory.
#[must_use]
pub fn uuid_path_under(root: &Path, uuid: Uuid) -> PathBuf {
    root.join(uuid_path(uuid))
}

// ---------------------------------------------------------------------------
// Tick and token sources
// ---------------------------------------------------------------------------

/// Monotonic timestamp source for change records.
///
/// Ticks are opaque orderings, not wall-clock times. The pipeline never
/// reorders changes; it only requires that callers hand it non-decreasing
/// ticks per source, which `next` guarantees within a process.
#[derive(Debug)]
pub struct TickSource(AtomicI64);

impl TickSource {
    /// A source whose first tick is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicI64::new(1))
    }

    /// Next tick, strictly greater than every tick handed out before.
    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Advance past an externally-observed tick (e.g. the newest timestamp
    /// in a source read from disk).
    pub fn observe(&self, tick: i64) {
        self.0.fetch_max(tick + 1, Ordering::Relaxed);
    }
}

impl Default for TickSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic token source for event notifications.
///
/// Consumers use the token to recognize cascaded notifications that stem
/// from a single original trigger.
#[derive(Debug)]
pub struct TokenSource(AtomicU64);

impl TokenSource {
    /// A source whose first token is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Next token.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_hex_round_trip() {
        let h = ContentHash::of(b"resource");
        let parsed: ContentHash = h.to_hex().parse().unwrap();
        assert_eq!(h, parsed);
        assert_eq!(h.to_hex().len(), 64);
    }

    #[test]
    fn content_hash_rejects_bad_hex() {
        assert!("zz".repeat(32).parse::<ContentHash>().is_err());
        assert!("ab".parse::<ContentHash>().is_err());
    }

    #[test]
    fn zero_hash_is_zero() {
        assert!(ContentHash::ZERO.is_zero());
        assert!(!ContentHash::of(b"x").is_zero());
    }

    #[test]
    fn hash64_is_stable() {
        // FNV-1a reference values.
        assert_eq!(hash64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(hash64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_ne!(KEY_RESOURCE_TYPE, KEY_DEPENDENCIES);
    }

    #[test]
    fn uuid_path_layout() {
        let uuid = Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef);
        let hex = uuid_hex(uuid);
        assert_eq!(hex, "0123456789abcdef0123456789abcdef");
        let p = uuid_path(uuid);
        assert_eq!(p, PathBuf::from("01/23/0123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn ticks_are_strictly_increasing() {
        let ticks = TickSource::new();
        let a = ticks.next();
        let b = ticks.next();
        assert!(b > a);
        ticks.observe(1000);
        assert!(ticks.next() > 1000);
    }
}
