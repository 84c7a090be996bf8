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

//! The two-segment (hot/cold) cache.
//!
//! New entries land in the cold list. A lookup marks an entry active with a
//! single atomic bit; promotion happens lazily, at eviction time. When a set
//! pushes the total over budget, the cold list is shrunk from its oldest end:
//! expired and idle entries are dropped, active ones are promoted to hot.
//! The hot list is bounded to a fraction of the budget; compaction clears
//! survivors' activity bits and demotes idle entries back to cold, so staying
//! hot requires being touched again.
//!
//! A single readers/writer lock guards the lists, the index, and the size
//! counters. Lookups take it shared; set, delete, and eviction take it
//! exclusive. The activity bit is the only state written under the shared
//! lock.

use std::{ptr::NonNull, sync::Arc};

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::hash_table::HashTable;
use parking_lot::RwLock;

use crate::{
    clock::{Clock, SystemClock},
    item::{Item, ItemView},
    lru::{LruList, Node, Verdict},
};

/// Cache configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheConfig {
    /// Total byte budget across both segments, including the per-entry
    /// envelope.
    pub max_bytes: u64,
    /// Upper bound on the hot segment as a fraction of `max_bytes`.
    ///
    /// # Panics
    ///
    /// Cache construction panics if the value is not in [0.0, 1.0].
    #[serde(default = "default_hot_fraction")]
    pub hot_fraction: f64,
}

fn default_hot_fraction() -> f64 {
    0.5
}

impl CacheConfig {
    /// Config with the given budget and the default hot fraction.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            hot_fraction: default_hot_fraction(),
        }
    }
}

/// The operations the protocol layer invokes on the cache.
///
/// Thread safety is the implementation's contract: any number of callers may
/// invoke these concurrently. Implementations must not retain the caller's
/// key slices past the call.
pub trait Handler: Send + Sync + 'static {
    /// Install an item, taking ownership of its buffer handle. Replaces any
    /// existing entry under the same key.
    fn set(&self, item: Item);

    /// Look up keys. The result has one slot per input key, in order;
    /// misses and expired entries are `None`.
    fn get(&self, keys: &[&[u8]]) -> Vec<Option<ItemView>>;

    /// Remove a key. Returns whether an entry was removed.
    fn delete(&self, key: &[u8]) -> bool;
}

struct CacheCore {
    hot: LruList,
    cold: LruList,
    index: HashTable<NonNull<Node>>,
    hash_builder: RandomState,
    max_bytes: u64,
    hot_max: u64,
}

// Nodes are reached only through the index and lists, which the facade
// guards with a readers/writer lock; shared access mutates nothing but the
// per-node atomic flags word.
unsafe impl Send for CacheCore {}
unsafe impl Sync for CacheCore {}

impl CacheCore {
    fn new(config: &CacheConfig) -> Self {
        assert!(
            (0.0..=1.0).contains(&config.hot_fraction),
            "hot_fraction must be in [0.0, 1.0], given: {}",
            config.hot_fraction
        );
        let hot_max = (config.max_bytes as f64 * config.hot_fraction) as u64;

        Self {
            hot: LruList::new(),
            cold: LruList::new(),
            index: HashTable::new(),
            hash_builder: RandomState::new(),
            max_bytes: config.max_bytes,
            hot_max,
        }
    }

    fn hash(&self, key: &[u8]) -> u64 {
        self.hash_builder.hash_one(key)
    }

    fn total(&self) -> u64 {
        self.hot.size() + self.cold.size()
    }

    fn node(&self, hash: u64, key: &[u8]) -> Option<&Node> {
        self.index
            .find(hash, |p| unsafe { p.as_ref().item().key.as_ref() == key })
            .map(|p| unsafe { &*p.as_ptr() })
    }

    /// Insert `ptr` into the index, returning the displaced node if the key
    /// was already present.
    fn index_insert(&mut self, ptr: NonNull<Node>) -> Option<NonNull<Node>> {
        use hashbrown::hash_table::Entry;

        let node = unsafe { ptr.as_ref() };
        match self.index.entry(
            node.hash(),
            |p| unsafe { p.as_ref().item().key == node.item().key },
            |p| unsafe { p.as_ref().hash() },
        ) {
            Entry::Occupied(mut o) => Some(std::mem::replace(o.get_mut(), ptr)),
            Entry::Vacant(v) => {
                v.insert(ptr);
                None
            }
        }
    }

    /// Detach `ptr` from whichever list its segment tag names.
    fn unlink(&mut self, ptr: NonNull<Node>) {
        unsafe {
            if ptr.as_ref().in_hot() {
                self.hot.remove(ptr);
            } else {
                self.cold.remove(ptr);
            }
        }
    }

    fn set(&mut self, item: Item, now: u64) {
        let hash = self.hash(&item.key);
        let ptr = Node::new(item, hash);

        // The displaced node's buffer lives on for any in-flight viewers.
        if let Some(old) = self.index_insert(ptr) {
            self.unlink(old);
            unsafe { Node::free(old) };
        }
        self.cold.push_back(ptr);

        if self.total() > self.max_bytes {
            self.evict(now);
        }
    }

    fn delete(&mut self, key: &[u8], hash: u64) -> bool {
        match self
            .index
            .find_entry(hash, |p| unsafe { p.as_ref().item().key.as_ref() == key })
        {
            Ok(o) => {
                let (ptr, _) = o.remove();
                self.unlink(ptr);
                unsafe { Node::free(ptr) };
                true
            }
            Err(_) => false,
        }
    }

    /// Drop the entry if it is still present and still expired at `now`.
    /// Used by lookups to purge expired hits after the shared pass.
    fn remove_if_expired(&mut self, key: &[u8], now: u64) {
        let hash = self.hash(key);
        if let Some(node) = self.node(hash, key) {
            if node.expired(now) {
                tracing::trace!(?key, "purging expired entry");
                self.delete(key, hash);
            }
        }
    }

    /// Enforce the byte budget after an insert.
    ///
    /// Repeats hot compaction and cold shrinking until the total fits; every
    /// round either drops a node or clears an activity bit, so the loop
    /// terminates. A final compaction bounds the hot segment, which cold
    /// promotions may have overflowed.
    fn evict(&mut self, now: u64) {
        tracing::trace!(
            total = self.total(),
            max_bytes = self.max_bytes,
            "enforcing cache budget"
        );

        while self.total() > self.max_bytes {
            if self.hot.size() > self.hot_max {
                self.compact_hot(now);
            }
            let target = self.max_bytes.saturating_sub(self.hot.size());
            self.shrink_cold(target, now);
        }
        if self.hot.size() > self.hot_max {
            self.compact_hot(now);
        }
    }

    /// Shrink hot toward its bound. Expired entries are dropped; active ones
    /// survive with their bit cleared, so a single future lookup is required
    /// to survive the next pass; idle ones are demoted to cold.
    fn compact_hot(&mut self, now: u64) {
        let Self {
            hot, cold, index, hot_max, ..
        } = self;

        hot.shrink(*hot_max, now, |hot, verdict, mut ptr| match verdict {
            Verdict::Expired => {
                index_remove(index, ptr);
                unsafe { Node::free(ptr) };
            }
            Verdict::Active => hot.push_back(ptr),
            Verdict::Inactive => {
                unsafe { ptr.as_mut().set_in_hot(false) };
                cold.push_back(ptr);
            }
        });
    }

    /// Shrink cold toward `target`. Active entries are promoted to hot; the
    /// rest are dropped and unindexed.
    fn shrink_cold(&mut self, target: u64, now: u64) {
        let Self { hot, cold, index, .. } = self;

        cold.shrink(target, now, |_, verdict, mut ptr| match verdict {
            Verdict::Active => {
                unsafe { ptr.as_mut().set_in_hot(true) };
                hot.push_back(ptr);
            }
            Verdict::Expired | Verdict::Inactive => {
                index_remove(index, ptr);
                unsafe { Node::free(ptr) };
            }
        });
    }

    #[cfg(test)]
    fn validate(&self) {
        self.hot.validate();
        self.cold.validate();
        assert!(self.total() <= self.max_bytes);
        assert!(self.hot.size() <= self.hot_max);

        assert_eq!(
            self.index.len(),
            self.hot.iter().count() + self.cold.iter().count()
        );
        for (list, in_hot) in [(&self.hot, true), (&self.cold, false)] {
            for node in list.iter() {
                assert_eq!(node.in_hot(), in_hot);
                let found = self.node(node.hash(), &node.item().key).unwrap();
                assert!(std::ptr::eq(found, node));
            }
        }
    }
}

impl Drop for CacheCore {
    fn drop(&mut self) {
        let ptrs: Vec<_> = self.index.drain().collect();
        for ptr in ptrs {
            self.unlink(ptr);
            unsafe { Node::free(ptr) };
        }
    }
}

fn index_remove(index: &mut HashTable<NonNull<Node>>, ptr: NonNull<Node>) {
    let node = unsafe { ptr.as_ref() };
    match index.find_entry(node.hash(), |p| unsafe { p.as_ref().item().key == node.item().key }) {
        Ok(o) => {
            debug_assert_eq!(*o.get(), ptr);
            o.remove();
        }
        Err(_) => debug_assert!(false, "evicted node missing from the index"),
    }
}

struct CacheInner {
    core: RwLock<CacheCore>,
    clock: Arc<dyn Clock>,
}

/// Shared handle to a two-segment cache.
///
/// Cloning is cheap; all clones address the same cache.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// Create a cache using the system clock.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a cache with a caller-supplied clock.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                core: RwLock::new(CacheCore::new(&config)),
                clock,
            }),
        }
    }

    /// Install an item; see [`Handler::set`].
    pub fn set(&self, item: Item) {
        let now = self.inner.clock.now();
        self.inner.core.write().set(item, now);
    }

    /// Look up keys; see [`Handler::get`].
    ///
    /// Runs under shared access, so any number of lookups proceed in
    /// parallel. Expired hits are purged under a short exclusive lock after
    /// the shared pass.
    pub fn get(&self, keys: &[&[u8]]) -> Vec<Option<ItemView>> {
        let now = self.inner.clock.now();
        let mut expired: Vec<Bytes> = Vec::new();

        let views = {
            let core = self.inner.core.read();
            keys.iter()
                .map(|&key| {
                    let node = core.node(core.hash(key), key)?;
                    if node.expired(now) {
                        expired.push(node.item().key.clone());
                        return None;
                    }
                    node.set_active();
                    let item = node.item();
                    Some(ItemView::new(item.key.clone(), item.flags, item.data.reader()))
                })
                .collect()
        };

        if !expired.is_empty() {
            let mut core = self.inner.core.write();
            for key in expired {
                core.remove_if_expired(&key, now);
            }
        }

        views
    }

    /// Remove a key; see [`Handler::delete`].
    pub fn delete(&self, key: &[u8]) -> bool {
        let mut core = self.inner.core.write();
        let hash = core.hash(key);
        core.delete(key, hash)
    }

    #[cfg(test)]
    fn with_core<T>(&self, f: impl FnOnce(&CacheCore) -> T) -> T {
        f(&self.inner.core.read())
    }
}

impl Handler for Cache {
    fn set(&self, item: Item) {
        Cache::set(self, item)
    }

    fn get(&self, keys: &[&[u8]]) -> Vec<Option<ItemView>> {
        Cache::get(self, keys)
    }

    fn delete(&self, key: &[u8]) -> bool {
        Cache::delete(self, key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use itertools::Itertools;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::pool::{ChunkPool, PoolConfig};

    const EXTRA: u64 = 256;

    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn at(now: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(now)))
        }

        fn advance(&self, secs: u64) {
            self.0.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn test_pool() -> ChunkPool {
        ChunkPool::new(PoolConfig {
            chunk_size: 4096,
            max_buffer_size: 16 * 1024 * 1024,
            recycle_capacity: 4096,
        })
    }

    fn cache(max_bytes: u64) -> (Cache, ChunkPool, Arc<ManualClock>) {
        let clock = ManualClock::at(100);
        let cache = Cache::with_clock(CacheConfig::new(max_bytes), clock.clone());
        (cache, test_pool(), clock)
    }

    fn item(pool: &ChunkPool, key: &str, payload: &[u8], expire_at: u64) -> Item {
        let mut buf = pool.acquire(payload.len()).unwrap();
        buf.copy_from_slice(payload);
        Item::new(
            Bytes::copy_from_slice(key.as_bytes()),
            0,
            expire_at,
            buf.freeze(),
        )
    }

    fn read(view: &mut ItemView) -> Vec<u8> {
        let mut out = Vec::new();
        view.write_to(&mut out).unwrap();
        out
    }

    fn get_one(cache: &Cache, key: &str) -> Option<Vec<u8>> {
        let mut views = cache.get(&[key.as_bytes()]);
        views.remove(0).map(|mut v| read(&mut v))
    }

    // Two 100-byte items with 1-byte keys fit exactly.
    fn two_item_budget() -> u64 {
        2 * (EXTRA + 1 + 100)
    }

    #[test]
    fn test_set_evicts_oldest_inactive() {
        // Three inserts into a two-item budget; the untouched oldest entry
        // goes.
        let (cache, pool, _) = cache(two_item_budget());

        cache.set(item(&pool, "a", &[1; 100], 0));
        cache.set(item(&pool, "b", &[2; 100], 0));
        cache.set(item(&pool, "c", &[3; 100], 0));

        assert_eq!(get_one(&cache, "a"), None);
        assert_eq!(get_one(&cache, "b"), Some(vec![2; 100]));
        assert_eq!(get_one(&cache, "c"), Some(vec![3; 100]));
        cache.with_core(|core| core.validate());
    }

    #[test]
    fn test_touched_entry_survives_eviction() {
        // A touched entry is promoted to hot at eviction time and outlives
        // a younger untouched one.
        let (cache, pool, _) = cache(two_item_budget());

        cache.set(item(&pool, "a", &[1; 100], 0));
        for _ in 0..10 {
            assert!(get_one(&cache, "a").is_some());
        }
        cache.set(item(&pool, "b", &[2; 100], 0));
        cache.set(item(&pool, "c", &[3; 100], 0));

        assert_eq!(get_one(&cache, "a"), Some(vec![1; 100]));
        assert_eq!(get_one(&cache, "b"), None);
        assert_eq!(get_one(&cache, "c"), Some(vec![3; 100]));
        cache.with_core(|core| core.validate());
    }

    #[test]
    fn test_expired_lookup_purges_entry() {
        let (cache, pool, clock) = cache(1024 * 1024);

        cache.set(item(&pool, "a", b"payload", clock.now()));
        clock.advance(1);

        assert_eq!(get_one(&cache, "a"), None);
        // The lookup removed the entry, not just hid it.
        assert!(!cache.delete(b"a"));
        cache.with_core(|core| core.validate());
    }

    #[test]
    fn test_unexpired_lookup_hits() {
        let (cache, pool, clock) = cache(1024 * 1024);

        cache.set(item(&pool, "a", b"payload", clock.now() + 10));
        assert_eq!(get_one(&cache, "a"), Some(b"payload".to_vec()));

        clock.advance(10);
        assert_eq!(get_one(&cache, "a"), None);
    }

    #[test]
    fn test_inflight_view_survives_replace() {
        // A view started before a replacing set streams the original
        // payload in full.
        let (cache, pool, _) = cache(1024 * 1024);

        cache.set(item(&pool, "a", &[1; 5000], 0));
        let mut views = cache.get(&[b"a".as_slice()]);
        let mut view = views.remove(0).unwrap();

        cache.set(item(&pool, "a", &[2; 5000], 0));

        assert_eq!(read(&mut view), vec![1; 5000]);
        assert_eq!(get_one(&cache, "a"), Some(vec![2; 5000]));
        cache.with_core(|core| core.validate());
    }

    #[test]
    fn test_delete() {
        let (cache, pool, _) = cache(1024 * 1024);

        cache.set(item(&pool, "a", b"x", 0));
        assert!(cache.delete(b"a"));
        assert!(!cache.delete(b"a"));
        assert_eq!(get_one(&cache, "a"), None);
        cache.with_core(|core| core.validate());
    }

    #[test]
    fn test_replace_updates_value_and_accounting() {
        let (cache, pool, _) = cache(1024 * 1024);

        cache.set(item(&pool, "a", &[1; 100], 0));
        cache.set(item(&pool, "a", &[2; 300], 0));

        assert_eq!(get_one(&cache, "a"), Some(vec![2; 300]));
        cache.with_core(|core| {
            assert_eq!(core.total(), EXTRA + 1 + 300);
            core.validate();
        });
    }

    #[test]
    fn test_flags_roundtrip() {
        let (cache, pool, _) = cache(1024 * 1024);

        let mut it = item(&pool, "a", b"v", 0);
        it.flags = 0xdead_beef;
        cache.set(it);

        let mut views = cache.get(&[b"a".as_slice()]);
        let view = views.remove(0).unwrap();
        assert_eq!(view.flags(), 0xdead_beef);
        assert_eq!(view.key(), b"a");
        assert_eq!(view.bytes(), 1);
    }

    #[test]
    fn test_steady_state_keeps_most_recent() {
        // 1000 distinct 1 KiB values through a 100 KiB cache.
        let max_bytes = 100 * 1024;
        let (cache, pool, _) = cache(max_bytes);

        let keys = (0..1000).map(|i| format!("k{:04}", i)).collect_vec();
        for key in &keys {
            cache.set(item(&pool, key, &[7; 1024], 0));
            cache.with_core(|core| core.validate());
        }

        let node_size = EXTRA + 5 + 1024;
        let capacity = (max_bytes / node_size) as usize;
        for key in &keys[keys.len() - capacity..] {
            assert!(get_one(&cache, key).is_some(), "missing {key}");
        }
        for key in &keys[..keys.len() - capacity] {
            assert!(get_one(&cache, key).is_none(), "unexpected {key}");
        }
    }

    #[test]
    fn test_promotion_overflow_is_rebalanced() {
        // Promote more than hot can hold, then verify the follow-up
        // compaction restores both bounds.
        let node = EXTRA + 1 + 100;
        let (cache, pool, _) = cache(4 * node);

        for key in ["a", "b", "c", "d"] {
            cache.set(item(&pool, key, &[0; 100], 0));
        }
        for key in ["a", "b", "c"] {
            assert!(get_one(&cache, key).is_some());
        }
        cache.set(item(&pool, "e", &[0; 100], 0));

        // The three touched entries survive; the untouched oldest one goes.
        assert!(get_one(&cache, "a").is_some());
        assert!(get_one(&cache, "b").is_some());
        assert!(get_one(&cache, "c").is_some());
        assert!(get_one(&cache, "d").is_none());
        assert!(get_one(&cache, "e").is_some());
        cache.with_core(|core| core.validate());
    }

    #[test]
    fn test_randomized_workload_invariants() {
        let mut rng = StdRng::seed_from_u64(42);
        let (cache, pool, clock) = cache(16 * 1024);

        for step in 0..2000 {
            let key = format!("k{}", rng.gen_range(0..50));
            match rng.gen_range(0..10) {
                0..=4 => {
                    let len = rng.gen_range(0..600);
                    let expire = if rng.gen_bool(0.2) {
                        clock.now() + rng.gen_range(1..5)
                    } else {
                        0
                    };
                    let payload = vec![(step % 251) as u8; len];
                    cache.set(item(&pool, &key, &payload, expire));
                }
                5..=7 => {
                    let _ = get_one(&cache, &key);
                }
                8 => {
                    let _ = cache.delete(key.as_bytes());
                }
                _ => clock.advance(1),
            }
            cache.with_core(|core| core.validate());
        }
    }

    #[test]
    fn test_roundtrip_random_items() {
        let mut rng = StdRng::seed_from_u64(7);
        let (cache, pool, _) = cache(64 * 1024 * 1024);

        for i in 0..200 {
            let key_len = rng.gen_range(1..=Item::MAX_KEY_SIZE);
            let key: String = (0..key_len).map(|_| rng.gen_range('a'..='z')).collect();
            let payload: Vec<u8> = (0..rng.gen_range(0..20_000)).map(|_| rng.gen()).collect();

            let mut it = item(&pool, &key, &payload, 0);
            it.flags = i;
            cache.set(it);

            let mut views = cache.get(&[key.as_bytes()]);
            let mut view = views.remove(0).unwrap();
            assert_eq!(view.flags(), i);
            assert_eq!(read(&mut view), payload);
        }
    }

    #[test]
    fn test_multi_key_get_preserves_order() {
        let (cache, pool, _) = cache(1024 * 1024);

        cache.set(item(&pool, "a", b"1", 0));
        cache.set(item(&pool, "c", b"3", 0));

        let views = cache.get(&[b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
        assert_eq!(views.len(), 3);
        assert!(views[0].is_some());
        assert!(views[1].is_none());
        assert!(views[2].is_some());
    }

    #[test]
    fn test_concurrent_gets_race_delete() {
        // Readers race a writer deleting and re-setting the same key; every
        // lookup streams the full payload or misses, and the
        // pool's free list returns to its seeded state once everything quiesces.
        let payload: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let pool = ChunkPool::new(PoolConfig {
            chunk_size: 512,
            max_buffer_size: 1024 * 1024,
            recycle_capacity: 4096,
        });
        let cache = Cache::with_clock(CacheConfig::new(1024 * 1024), ManualClock::at(100));

        // Seed the free list so the run never allocates fresh chunks; exact
        // conservation then doubles as a leak check.
        drop(pool.acquire(512 * 512).unwrap());
        let seeded = pool.free_chunks();

        let readers = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let payload = payload.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let mut views = cache.get(&[b"k".as_slice()]);
                        if let Some(mut view) = views.remove(0) {
                            let mut out = Vec::new();
                            view.write_to(&mut out).unwrap();
                            assert_eq!(out, payload);
                        }
                    }
                })
            })
            .collect_vec();

        for _ in 0..100 {
            let mut buf = pool.acquire(payload.len()).unwrap();
            buf.copy_from_slice(&payload);
            cache.set(Item::new(Bytes::from_static(b"k"), 0, 0, buf.freeze()));
            cache.delete(b"k");
        }

        for reader in readers {
            reader.join().unwrap();
        }
        cache.delete(b"k");

        cache.with_core(|core| core.validate());
        assert_eq!(pool.free_chunks(), seeded);
    }
}
