// SPDX-License-Identifier: MIT OR Apache-2.0
//! The bounded artifact stream handed out by compiled opens.

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

/// Read-only, sequential, size-known view of one opened artifact.
///
/// The stream ends when exactly the declared number of bytes has been
/// delivered, or early when the connection behind it went away; the two
/// are distinguishable through [`is_complete`](Self::is_complete).
/// Dropping the stream mid-body is safe: the worker keeps draining the
/// connection to stay frame-aligned.
#[derive(Debug)]
pub struct CompiledStream {
    declared: u64,
    delivered: u64,
    chunks: Option<mpsc::Receiver<Bytes>>,
    current: Bytes,
}

impl CompiledStream {
    pub(crate) fn new(declared: u64, chunks: Option<mpsc::Receiver<Bytes>>) -> Self {
        Self {
            declared,
            delivered: 0,
            chunks,
            current: Bytes::new(),
        }
    }

    /// Total artifact size announced by the open reply.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.declared
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.delivered
    }

    /// `true` once every declared byte has been read.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.delivered == self.declared
    }

    /// Read into `buf`; returns the number of bytes copied, `0` at end
    /// of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() || self.is_complete() {
            return 0;
        }
        if self.current.is_empty() {
            let Some(chunks) = self.chunks.as_mut() else {
                return 0;
            };
            match chunks.recv().await {
                Some(chunk) => self.current = chunk,
                None => {
                    // Disconnected with the input exhausted: end of
                    // stream, complete or not.
                    self.chunks = None;
                    return 0;
                }
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        self.delivered += n as u64;
        n
    }

    /// Read the whole remaining stream into memory.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.declared - self.delivered) as usize);
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = self.read(&mut buf).await;
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_stream_is_immediately_complete() {
        let mut stream = CompiledStream::new(0, None);
        assert!(stream.is_complete());
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await, 0);
    }

    #[tokio::test]
    async fn reads_across_chunk_boundaries() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        let mut stream = CompiledStream::new(11, Some(rx));
        let mut buf = [0u8; 4];
        let mut collected = Vec::new();
        loop {
            let n = stream.read(&mut buf).await;
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"hello world");
        assert!(stream.is_complete());
        assert_eq!(stream.bytes_read(), 11);
    }

    #[tokio::test]
    async fn early_disconnect_ends_stream_incomplete() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Bytes::from_static(b"part")).await.unwrap();
        drop(tx);

        let mut stream = CompiledStream::new(100, Some(rx));
        let body = stream.read_to_end().await;
        assert_eq!(body, b"part");
        assert!(!stream.is_complete());
    }
}
