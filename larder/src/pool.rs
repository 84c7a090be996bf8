// Copyright 2025 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pool of fixed-size byte chunks and the ref-counted buffers built from them.
//!
//! Values are stored as an ordered list of chunks instead of one contiguous
//! allocation. That keeps large values off the allocator's slow path, lets a
//! network reader land an input buffer directly in a chunk, and makes sharing
//! cheap: a [`Buffer`] is ref-counted, so the cache and any number of
//! in-flight readers hold the same chunks, and the last handle to drop
//! returns them to the pool's free list.

use std::{
    io::{Read, Write},
    sync::Arc,
};

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

use crate::error::{Error, Result};

/// Chunk pool configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PoolConfig {
    /// Size of a single chunk in bytes.
    ///
    /// Must be at least the size of the protocol input buffer so a single
    /// read can land contiguously in one chunk.
    pub chunk_size: usize,
    /// Upper bound on a single buffer, in bytes. [`ChunkPool::acquire`]
    /// refuses anything larger.
    pub max_buffer_size: usize,
    /// Number of released chunks kept on the free list. Chunks released
    /// beyond this are dropped.
    pub recycle_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_buffer_size: 64 * 1024 * 1024,
            recycle_capacity: 1024,
        }
    }
}

struct PoolInner {
    chunk_size: usize,
    max_buffer_size: usize,
    free: Option<ArrayQueue<BytesMut>>,
}

/// A process-wide pool of fixed-size byte chunks.
///
/// Cloning is cheap and shares the free list. Acquire, release, and buffer
/// clone are all safe under concurrent callers; a chunk on the free list is
/// owned by the queue and can never be observed by a live buffer.
#[derive(Clone)]
pub struct ChunkPool {
    inner: Arc<PoolInner>,
}

impl ChunkPool {
    /// Create a pool.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    pub fn new(config: PoolConfig) -> Self {
        assert!(config.chunk_size > 0, "chunk size must be positive");
        let inner = PoolInner {
            chunk_size: config.chunk_size,
            max_buffer_size: config.max_buffer_size,
            free: if config.recycle_capacity == 0 {
                None
            } else {
                Some(ArrayQueue::new(config.recycle_capacity))
            },
        };
        Self { inner: Arc::new(inner) }
    }

    /// Size of a single chunk in bytes.
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Number of chunks currently on the free list.
    pub fn free_chunks(&self) -> usize {
        self.inner.free.as_ref().map(|q| q.len()).unwrap_or(0)
    }

    /// Acquire a writable buffer of exactly `len` bytes, built from one or
    /// more chunks. Sizes up to the chunk size use a single chunk.
    pub fn acquire(&self, len: usize) -> Result<BufferMut> {
        if len > self.inner.max_buffer_size {
            return Err(Error::BufferTooLarge {
                size: len,
                max: self.inner.max_buffer_size,
            });
        }

        let chunk_size = self.inner.chunk_size;
        let chunks = (0..len.div_ceil(chunk_size))
            .map(|i| {
                let target = chunk_size.min(len - i * chunk_size);
                let mut chunk = self.pop_chunk();
                chunk.resize(target, 0);
                chunk
            })
            .collect();

        Ok(BufferMut {
            pool: self.clone(),
            chunks,
            len,
        })
    }

    fn pop_chunk(&self) -> BytesMut {
        self.inner
            .free
            .as_ref()
            .and_then(|q| q.pop())
            .unwrap_or_else(|| BytesMut::with_capacity(self.inner.chunk_size))
    }

    fn recycle(&self, mut chunk: BytesMut) {
        chunk.clear();
        if let Some(q) = self.inner.free.as_ref() {
            let _ = q.push(chunk);
        }
    }
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool")
            .field("chunk_size", &self.inner.chunk_size)
            .field("max_buffer_size", &self.inner.max_buffer_size)
            .field("free_chunks", &self.free_chunks())
            .finish()
    }
}

/// A uniquely owned, writable buffer handed out by [`ChunkPool::acquire`].
///
/// Fill it with [`BufferMut::fill_from`] or [`BufferMut::copy_from_slice`],
/// then [`BufferMut::freeze`] it into a shareable [`Buffer`]. Dropping an
/// unfrozen buffer returns its chunks to the pool.
pub struct BufferMut {
    pool: ChunkPool,
    chunks: Vec<BytesMut>,
    len: usize,
}

impl BufferMut {
    /// Total buffer length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill the whole buffer by reading exactly [`BufferMut::len`] bytes
    /// from `r`, chunk by chunk.
    pub fn fill_from<R: Read>(&mut self, r: &mut R) -> std::io::Result<()> {
        for chunk in self.chunks.iter_mut() {
            r.read_exact(&mut chunk[..])?;
        }
        Ok(())
    }

    /// Fill the whole buffer from `src`.
    ///
    /// # Panics
    ///
    /// Panics if `src.len()` differs from [`BufferMut::len`].
    pub fn copy_from_slice(&mut self, src: &[u8]) {
        assert_eq!(src.len(), self.len);
        let mut offset = 0;
        for chunk in self.chunks.iter_mut() {
            let n = chunk.len();
            chunk.copy_from_slice(&src[offset..offset + n]);
            offset += n;
        }
    }

    /// Freeze into an immutable, ref-counted [`Buffer`].
    pub fn freeze(mut self) -> Buffer {
        Buffer {
            inner: Arc::new(BufferInner {
                pool: self.pool.clone(),
                chunks: std::mem::take(&mut self.chunks),
                len: self.len,
            }),
        }
    }
}

impl Drop for BufferMut {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.pool.recycle(chunk);
        }
    }
}

struct BufferInner {
    pool: ChunkPool,
    chunks: Vec<BytesMut>,
    len: usize,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.pool.recycle(chunk);
        }
    }
}

/// An immutable, ref-counted chunk sequence holding one value's payload.
///
/// Clone shares the chunks; the last clone to drop returns them to the pool.
/// A buffer outlives the cache entry it was installed under, so readers keep
/// streaming a consistent payload while the entry is replaced or evicted.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// Total payload length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// A fresh reader positioned at offset 0. The reader holds its own
    /// reference to the chunks.
    pub fn reader(&self) -> BufferReader {
        BufferReader {
            buffer: self.clone(),
            chunk: 0,
            offset: 0,
        }
    }

    /// Copy the payload into a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.inner.len);
        for chunk in &self.inner.chunks {
            v.extend_from_slice(chunk);
        }
        v
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("len", &self.inner.len).finish()
    }
}

/// Streams a [`Buffer`]'s bytes to a sink in chunk order, without copying
/// them into a contiguous region first.
pub struct BufferReader {
    buffer: Buffer,
    chunk: usize,
    offset: usize,
}

impl BufferReader {
    /// Total payload length in bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Reset the reader to offset 0.
    pub fn restart(&mut self) {
        self.chunk = 0;
        self.offset = 0;
    }

    /// Write all remaining bytes to `w`. Returns the number of bytes written.
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> std::io::Result<u64> {
        let mut written = 0u64;
        while self.chunk < self.buffer.inner.chunks.len() {
            let chunk = &self.buffer.inner.chunks[self.chunk];
            let rest = &chunk[self.offset..];
            w.write_all(rest)?;
            written += rest.len() as u64;
            self.chunk += 1;
            self.offset = 0;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(chunk_size: usize) -> ChunkPool {
        ChunkPool::new(PoolConfig {
            chunk_size,
            max_buffer_size: 1024 * 1024,
            recycle_capacity: 64,
        })
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_single_chunk_roundtrip() {
        let pool = pool(1024);
        let data = payload(100);

        let mut buf = pool.acquire(100).unwrap();
        buf.copy_from_slice(&data);
        let buf = buf.freeze();

        assert_eq!(buf.len(), 100);
        assert_eq!(buf.to_vec(), data);
    }

    #[test]
    fn test_multi_chunk_roundtrip() {
        let pool = pool(64);
        let data = payload(1000);

        let mut buf = pool.acquire(1000).unwrap();
        buf.copy_from_slice(&data);
        let buf = buf.freeze();

        let mut out = Vec::new();
        let written = buf.reader().write_to(&mut out).unwrap();
        assert_eq!(written, 1000);
        assert_eq!(out, data);
    }

    #[test]
    fn test_fill_from_reader() {
        let pool = pool(16);
        let data = payload(100);

        let mut buf = pool.acquire(100).unwrap();
        buf.fill_from(&mut &data[..]).unwrap();
        assert_eq!(buf.freeze().to_vec(), data);
    }

    #[test]
    fn test_empty_buffer() {
        let pool = pool(64);
        let buf = pool.acquire(0).unwrap().freeze();
        assert!(buf.is_empty());

        let mut out = Vec::new();
        assert_eq!(buf.reader().write_to(&mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_acquire_too_large() {
        let pool = ChunkPool::new(PoolConfig {
            chunk_size: 64,
            max_buffer_size: 128,
            recycle_capacity: 8,
        });
        assert!(matches!(
            pool.acquire(129),
            Err(Error::BufferTooLarge { size: 129, max: 128 })
        ));
        assert!(pool.acquire(128).is_ok());
    }

    #[test]
    fn test_clone_shares_payload() {
        let pool = pool(64);
        let data = payload(200);

        let mut buf = pool.acquire(200).unwrap();
        buf.copy_from_slice(&data);
        let a = buf.freeze();
        let b = a.clone();
        drop(a);

        assert_eq!(b.to_vec(), data);
    }

    #[test]
    fn test_drop_recycles_chunks() {
        let pool = pool(64);
        assert_eq!(pool.free_chunks(), 0);

        let buf = pool.acquire(200).unwrap().freeze();
        let reader = buf.reader();
        drop(buf);
        // The reader still holds the chunks.
        assert_eq!(pool.free_chunks(), 0);

        drop(reader);
        assert_eq!(pool.free_chunks(), 4);

        // Reacquiring reuses the recycled chunks.
        let _buf = pool.acquire(200).unwrap();
        assert_eq!(pool.free_chunks(), 0);
    }

    #[test]
    fn test_unfrozen_drop_recycles() {
        let pool = pool(64);
        let buf = pool.acquire(128).unwrap();
        drop(buf);
        assert_eq!(pool.free_chunks(), 2);
    }

    #[test]
    fn test_reader_restart() {
        let pool = pool(32);
        let data = payload(80);

        let mut buf = pool.acquire(80).unwrap();
        buf.copy_from_slice(&data);
        let buf = buf.freeze();

        let mut reader = buf.reader();
        let mut out = Vec::new();
        reader.write_to(&mut out).unwrap();
        reader.restart();
        reader.write_to(&mut out).unwrap();
        assert_eq!(out.len(), 160);
        assert_eq!(&out[..80], &data[..]);
        assert_eq!(&out[80..], &data[..]);
    }
}
