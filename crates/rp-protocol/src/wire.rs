// SPDX-License-Identifier: MIT OR Apache-2.0
//! Little-endian primitive encoding shared by both protocols.

use crate::ProtocolError;
use bytes::BufMut;
use uuid::Uuid;

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.put_u32_le(value);
}

pub(crate) fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.put_u64_le(value);
}

pub(crate) fn put_i64(out: &mut Vec<u8>, value: i64) {
    out.put_i64_le(value);
}

pub(crate) fn put_uuid(out: &mut Vec<u8>, uuid: Uuid) {
    out.put_u128_le(uuid.as_u128());
}

pub(crate) fn put_hash(out: &mut Vec<u8>, hash: rp_core::ContentHash) {
    out.put_slice(hash.as_bytes());
}

/// Checked little-endian reader over a payload slice.
///
/// Every accessor names the field it is reading so a truncated frame
/// reports *what* was missing, which is the difference between a useful
/// desync log line and a mystery.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Decode from `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Take `n` raw bytes.
    pub fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated { what });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Take every remaining byte.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    /// Read a `u32`.
    pub fn u32(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(
            self.bytes(4, what)?.try_into().expect("4 bytes"),
        ))
    }

    /// Read a `u64`.
    pub fn u64(&mut self, what: &'static str) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(
            self.bytes(8, what)?.try_into().expect("8 bytes"),
        ))
    }

    /// Read an `i64`.
    pub fn i64(&mut self, what: &'static str) -> Result<i64, ProtocolError> {
        Ok(i64::from_le_bytes(
            self.bytes(8, what)?.try_into().expect("8 bytes"),
        ))
    }

    /// Read a UUID (little-endian `u128`).
    pub fn uuid(&mut self, what: &'static str) -> Result<Uuid, ProtocolError> {
        let raw = u128::from_le_bytes(self.bytes(16, what)?.try_into().expect("16 bytes"));
        Ok(Uuid::from_u128(raw))
    }

    /// Read a 256-bit content hash.
    pub fn hash(&mut self, what: &'static str) -> Result<rp_core::ContentHash, ProtocolError> {
        let raw: [u8; 32] = self.bytes(32, what)?.try_into().expect("32 bytes");
        Ok(rp_core::ContentHash::from_bytes(raw))
    }

    /// Assert the payload is fully consumed; trailing bytes mean the peer
    /// and we disagree about the layout.
    pub fn finish(&self, what: &'static str) -> Result<(), ProtocolError> {
        if self.remaining() != 0 {
            return Err(ProtocolError::Malformed { what });
        }
        Ok(())
    }
}
