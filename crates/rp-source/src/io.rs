// SPDX-License-Identifier: MIT OR Apache-2.0
//! On-disk source formats.
//!
//! Binary and text share one record layout and differ only in separators:
//!
//! ```text
//! binary:  i64 ts | u64 key | u64 platform | u8 op | payload
//! text:    <ts> SP <key> SP <platform> SP <op> [SP payload] LF
//! ```
//!
//! `op` is `'='` (value, length-prefixed), `'#'` (blob checksum + size) or
//! `'-'` (unset). The canonical binary serialization is also the input of
//! the source content hash.

use crate::change::ChangeValue;
use crate::source::{OwnedChange, OwnedPayload, ResourceSource, SourceState};
use crate::SourceError;
use rp_core::ContentHash;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

const OP_VALUE: u8 = b'=';
const OP_BLOB: u8 = b'#';
const OP_UNSET: u8 = b'-';

/// Which on-disk format a source was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Canonical binary records.
    Binary,
    /// Space-separated text records.
    Text,
}

impl ResourceSource {
    /// Serialize every change in append order.
    ///
    /// On success the source transitions to [`SourceState::Written`]; a
    /// failed write leaves both the source and its state untouched.
    pub fn write_to<W: Write>(&mut self, writer: &mut W, binary: bool) -> Result<(), SourceError> {
        let bytes = if binary {
            self.encode_binary()
        } else {
            self.encode_text()
        };
        writer.write_all(&bytes)?;
        self.set_state(SourceState::Written);
        Ok(())
    }

    /// Write to a file, creating parent directories on demand.
    pub fn write_file(&mut self, path: &Path, binary: bool) -> Result<(), SourceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = if binary {
            self.encode_binary()
        } else {
            self.encode_text()
        };
        fs::write(path, bytes)?;
        self.set_state(SourceState::Written);
        Ok(())
    }

    /// Decode a source from a reader, sniffing the format.
    ///
    /// A stream that parses fully as text records is text; anything else
    /// must parse as binary records or the call fails with
    /// [`SourceError::Corrupt`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<ResourceSource, SourceError> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Self::decode(&buf)
    }

    /// Decode a source file.
    pub fn read_file(path: &Path) -> Result<ResourceSource, SourceError> {
        Self::decode(&fs::read(path)?)
    }

    fn decode(buf: &[u8]) -> Result<ResourceSource, SourceError> {
        let (changes, format) = match decode_text(buf) {
            Ok(changes) => (changes, SourceFormat::Text),
            Err(_) => (decode_binary(buf)?, SourceFormat::Binary),
        };
        let mut source = ResourceSource::new();
        for change in changes {
            source.append_loaded(change);
        }
        source.set_state(SourceState::Loaded);
        source.set_loaded_format(format);
        Ok(source)
    }

    /// SHA-256 of the canonical binary serialization.
    ///
    /// This is the hash that propagates into compiled artifact headers;
    /// it depends only on the logical change list, not on which format the
    /// source happened to be stored in.
    #[must_use]
    pub fn source_hash(&self) -> ContentHash {
        ContentHash::of(&self.encode_binary())
    }

    fn encode_binary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.change_count() * 64);
        for change in self.iter() {
            out.extend_from_slice(&change.timestamp.to_le_bytes());
            out.extend_from_slice(&change.key.to_le_bytes());
            out.extend_from_slice(&change.platform.to_le_bytes());
            match change.value {
                ChangeValue::Value(bytes) => {
                    out.push(OP_VALUE);
                    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    out.extend_from_slice(bytes);
                }
                ChangeValue::Blob { checksum, size } => {
                    out.push(OP_BLOB);
                    out.extend_from_slice(&checksum.to_le_bytes());
                    out.extend_from_slice(&size.to_le_bytes());
                }
                ChangeValue::Unset => out.push(OP_UNSET),
            }
        }
        out
    }

    fn encode_text(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.change_count() * 48);
        for change in self.iter() {
            out.extend_from_slice(
                format!("{} {} {} ", change.timestamp, change.key, change.platform).as_bytes(),
            );
            match change.value {
                ChangeValue::Value(bytes) => {
                    out.push(OP_VALUE);
                    out.extend_from_slice(format!(" {} ", bytes.len()).as_bytes());
                    out.extend_from_slice(bytes);
                }
                ChangeValue::Blob { checksum, size } => {
                    out.push(OP_BLOB);
                    out.extend_from_slice(format!(" {checksum} {size}").as_bytes());
                }
                ChangeValue::Unset => out.push(OP_UNSET),
            }
            out.push(b'\n');
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Binary decoding
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn corrupt(&self, reason: &'static str) -> SourceError {
        SourceError::Corrupt {
            offset: self.pos,
            reason,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SourceError> {
        if self.buf.len() - self.pos < n {
            return Err(self.corrupt("truncated record"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SourceError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, SourceError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, SourceError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn i64(&mut self) -> Result<i64, SourceError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }
}

fn decode_binary(buf: &[u8]) -> Result<Vec<OwnedChange>, SourceError> {
    let mut cursor = Cursor::new(buf);
    let mut changes = Vec::new();
    while !cursor.done() {
        let timestamp = cursor.i64()?;
        let key = cursor.u64()?;
        let platform = cursor.u64()?;
        let payload = match cursor.u8()? {
            OP_VALUE => {
                let len = cursor.u32()? as usize;
                OwnedPayload::Value(cursor.take(len)?.to_vec())
            }
            OP_BLOB => OwnedPayload::Blob {
                checksum: cursor.u64()?,
                size: cursor.u64()?,
            },
            OP_UNSET => OwnedPayload::Unset,
            _ => return Err(cursor.corrupt("unknown change op")),
        };
        changes.push(OwnedChange {
            timestamp,
            key,
            platform,
            payload,
        });
    }
    Ok(changes)
}

// ---------------------------------------------------------------------------
// Text decoding
// ---------------------------------------------------------------------------

struct TextCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TextCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn corrupt(&self, reason: &'static str) -> SourceError {
        SourceError::Corrupt {
            offset: self.pos,
            reason,
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), SourceError> {
        if self.buf.get(self.pos) == Some(&byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.corrupt("unexpected separator"))
        }
    }

    fn byte(&mut self) -> Result<u8, SourceError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| self.corrupt("truncated record"))?;
        self.pos += 1;
        Ok(b)
    }

    fn raw(&mut self, n: usize) -> Result<&'a [u8], SourceError> {
        if self.buf.len() - self.pos < n {
            return Err(self.corrupt("truncated value"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn digits(&mut self) -> Result<&'a str, SourceError> {
        let start = self.pos;
        if self.buf.get(self.pos) == Some(&b'-') {
            self.pos += 1;
        }
        while self.buf.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.corrupt("expected number"));
        }
        std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|_| self.corrupt("non-ascii number"))
    }

    fn u64(&mut self) -> Result<u64, SourceError> {
        self.digits()?
            .parse()
            .map_err(|_| self.corrupt("number out of range"))
    }

    fn i64(&mut self) -> Result<i64, SourceError> {
        self.digits()?
            .parse()
            .map_err(|_| self.corrupt("number out of range"))
    }
}

fn decode_text(buf: &[u8]) -> Result<Vec<OwnedChange>, SourceError> {
    let mut cursor = TextCursor::new(buf);
    let mut changes = Vec::new();
    while !cursor.done() {
        let timestamp = cursor.i64()?;
        cursor.expect(b' ')?;
        let key = cursor.u64()?;
        cursor.expect(b' ')?;
        let platform = cursor.u64()?;
        cursor.expect(b' ')?;
        let payload = match cursor.byte()? {
            OP_VALUE => {
                cursor.expect(b' ')?;
                let len = cursor.u64()? as usize;
                cursor.expect(b' ')?;
                OwnedPayload::Value(cursor.raw(len)?.to_vec())
            }
            OP_BLOB => {
                cursor.expect(b' ')?;
                let checksum = cursor.u64()?;
                cursor.expect(b' ')?;
                let size = cursor.u64()?;
                OwnedPayload::Blob { checksum, size }
            }
            OP_UNSET => OwnedPayload::Unset,
            _ => return Err(cursor.corrupt("unknown change op")),
        };
        cursor.expect(b'\n')?;
        changes.push(OwnedChange {
            timestamp,
            key,
            platform,
            payload,
        });
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeValue;

    fn sample() -> ResourceSource {
        let mut source = ResourceSource::new();
        source.set(1, 10, 0, b"hello");
        source.set_blob(2, 11, 4, 0xdead_beef, 4096);
        source.unset(3, 10, 4);
        source.set(4, 10, 0, b"bytes with \n and spaces");
        source
    }

    fn logical(source: &ResourceSource) -> Vec<(i64, u64, u64, String)> {
        source
            .iter()
            .map(|c| {
                let payload = match c.value {
                    ChangeValue::Value(v) => format!("={}", String::from_utf8_lossy(v)),
                    ChangeValue::Blob { checksum, size } => format!("#{checksum}/{size}"),
                    ChangeValue::Unset => "-".to_string(),
                };
                (c.timestamp, c.key, c.platform, payload)
            })
            .collect()
    }

    #[test]
    fn binary_round_trip() {
        let mut source = sample();
        let mut buf = Vec::new();
        source.write_to(&mut buf, true).unwrap();
        assert_eq!(source.state(), SourceState::Written);

        let loaded = ResourceSource::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.state(), SourceState::Loaded);
        assert_eq!(loaded.loaded_format(), Some(SourceFormat::Binary));
        assert_eq!(logical(&source), logical(&loaded));
    }

    #[test]
    fn text_round_trip() {
        let mut source = sample();
        let mut buf = Vec::new();
        source.write_to(&mut buf, false).unwrap();

        let loaded = ResourceSource::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.loaded_format(), Some(SourceFormat::Text));
        assert_eq!(logical(&source), logical(&loaded));
    }

    #[test]
    fn hash_is_format_independent() {
        let mut source = sample();
        let mut text = Vec::new();
        source.write_to(&mut text, false).unwrap();
        let loaded = ResourceSource::read_from(&mut text.as_slice()).unwrap();
        assert_eq!(source.source_hash(), loaded.source_hash());
    }

    #[test]
    fn truncated_binary_is_corrupt() {
        let mut source = sample();
        let mut buf = Vec::new();
        source.write_to(&mut buf, true).unwrap();
        buf.truncate(buf.len() - 3);
        let err = ResourceSource::read_from(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, SourceError::Corrupt { .. }));
    }

    #[test]
    fn garbage_is_corrupt() {
        let err = ResourceSource::read_from(&mut &b"\xff\xfe\xfd"[..]).unwrap_err();
        assert!(matches!(err, SourceError::Corrupt { .. }));
    }
}
