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

//! larder is an in-memory key/value cache engine built for a memcached-style
//! server.
//!
//! The engine combines three co-designed pieces:
//!
//! - A [`ChunkPool`] that vends fixed-size byte chunks and assembles them into
//!   ref-counted [`Buffer`]s, so large values are stored without a single
//!   large allocation and can be streamed to many readers without copying.
//! - A two-segment (hot/cold) LRU with per-entry activity tracking. Lookups
//!   mark entries active with a single atomic bit; eviction promotes touched
//!   entries from cold to hot and demotes idle hot entries, all in O(1)
//!   amortized work per touched entry.
//! - A readers/writer concurrency contract: any number of lookups run in
//!   parallel under a shared lock while inserts, deletes, and eviction take
//!   the lock exclusively. Buffer lifetimes are independent of the lock, so a
//!   value can be streamed to a client while the cache replaces or evicts it.

pub mod cache;
pub mod clock;
pub mod error;
pub mod item;
pub mod pool;

mod lru;

pub use cache::{Cache, CacheConfig, Handler};
pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use item::{Item, ItemView};
pub use pool::{Buffer, BufferMut, BufferReader, ChunkPool, PoolConfig};
