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

use std::io::Write;

use bytes::Bytes;

use crate::pool::{Buffer, BufferReader};

/// A value to install in the cache: key, opaque flags, absolute expiry, and
/// the pooled payload buffer.
///
/// The cache takes ownership of the buffer handle on insert.
#[derive(Debug, Clone)]
pub struct Item {
    /// Entry key. At most [`Item::MAX_KEY_SIZE`] bytes.
    pub key: Bytes,
    /// Opaque 32-bit flags, round-tripped to readers untouched.
    pub flags: u32,
    /// Absolute expiry in epoch seconds. `0` means the item never expires.
    pub expire_at: u64,
    /// Payload buffer acquired from the cache's pool.
    pub data: Buffer,
}

impl Item {
    /// Maximum key length in bytes.
    pub const MAX_KEY_SIZE: usize = 250;

    /// Create an item.
    ///
    /// # Panics
    ///
    /// Panics if the key is longer than [`Item::MAX_KEY_SIZE`].
    pub fn new(key: Bytes, flags: u32, expire_at: u64, data: Buffer) -> Self {
        assert!(key.len() <= Self::MAX_KEY_SIZE, "key too long");
        Self {
            key,
            flags,
            expire_at,
            data,
        }
    }

    /// Whether the item's expiry has passed at `now`.
    pub fn expired(&self, now: u64) -> bool {
        self.expire_at != 0 && now >= self.expire_at
    }
}

/// A read-only handle to one cache hit, handed out by lookups.
///
/// The view pairs the item metadata with its own reference to the payload
/// buffer, so it stays valid and consistent while the cache replaces or
/// evicts the entry. Dropping the view releases the reference.
pub struct ItemView {
    key: Bytes,
    flags: u32,
    reader: BufferReader,
}

impl ItemView {
    pub(crate) fn new(key: Bytes, flags: u32, reader: BufferReader) -> Self {
        Self { key, flags, reader }
    }

    /// Entry key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Opaque flags stored with the entry.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Payload length in bytes.
    pub fn bytes(&self) -> usize {
        self.reader.len()
    }

    /// Stream the payload to `w`. Delivers exactly [`ItemView::bytes`] bytes
    /// when called once on a fresh view.
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> std::io::Result<u64> {
        self.reader.write_to(w)
    }
}

impl std::fmt::Debug for ItemView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemView")
            .field("key", &self.key)
            .field("flags", &self.flags)
            .field("bytes", &self.reader.len())
            .finish()
    }
}
