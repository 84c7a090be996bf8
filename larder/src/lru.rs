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

//! Intrusive LRU list with sentinel head/tail nodes.
//!
//! The head end is the oldest (first considered for eviction), the tail end
//! is the freshest. Sentinels keep insert and detach free of null checks.
//! Invariants between operations:
//!
//! - The list owns every node strictly between head and tail; both sentinels
//!   are always present.
//! - `size` equals the sum of `node.size()` over owned nodes.
//! - The prev/next chain is well-formed in both directions.
//! - No owned node holds recycled payload chunks.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicU8, Ordering},
};

use bitflags::bitflags;

use crate::item::Item;

/// Approximate per-entry envelope: node links and flags, the item metadata,
/// the buffer descriptor, and two hash-table slots. Compensates the byte
/// budget so a flood of zero-length items cannot blow up real heap usage.
pub(crate) const EXTRA_SIZE_PER_NODE: u64 = 256;

bitflags! {
    struct NodeFlags: u8 {
        const ACTIVE = 0b0000_0001;
    }
}

/// One cache entry, linked into exactly one of the hot or cold lists.
pub(crate) struct Node {
    // `None` only in sentinels.
    item: Option<Item>,
    hash: u64,
    in_hot: bool,
    // The ACTIVE bit is the only node state written under the shared cache
    // lock; all other fields require the exclusive lock.
    flags: AtomicU8,
    prev: Option<NonNull<Node>>,
    next: Option<NonNull<Node>>,
}

impl Node {
    /// Allocate a node for `item` and leak it to a raw pointer. The cache
    /// frees it with [`Node::free`] when the entry is dropped.
    pub(crate) fn new(item: Item, hash: u64) -> NonNull<Node> {
        NonNull::from(Box::leak(Box::new(Node {
            item: Some(item),
            hash,
            in_hot: false,
            flags: AtomicU8::new(0),
            prev: None,
            next: None,
        })))
    }

    fn sentinel() -> NonNull<Node> {
        NonNull::from(Box::leak(Box::new(Node {
            item: None,
            hash: 0,
            in_hot: false,
            flags: AtomicU8::new(0),
            prev: None,
            next: None,
        })))
    }

    /// Free a node allocated with [`Node::new`]. Dropping the item releases
    /// its buffer reference; the payload itself lives until the last reader
    /// releases too.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Node::new`], be unlinked, and never be used
    /// again.
    pub(crate) unsafe fn free(ptr: NonNull<Node>) {
        debug_assert!(ptr.as_ref().prev.is_none() && ptr.as_ref().next.is_none());
        drop(Box::from_raw(ptr.as_ptr()));
    }

    pub(crate) fn item(&self) -> &Item {
        self.item.as_ref().unwrap()
    }

    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }

    pub(crate) fn in_hot(&self) -> bool {
        self.in_hot
    }

    pub(crate) fn set_in_hot(&mut self, in_hot: bool) {
        self.in_hot = in_hot;
    }

    /// Size of the entry for budgeting purposes.
    pub(crate) fn size(&self) -> u64 {
        let item = self.item();
        EXTRA_SIZE_PER_NODE + item.key.len() as u64 + item.data.len() as u64
    }

    pub(crate) fn expired(&self, now: u64) -> bool {
        self.item().expired(now)
    }

    /// Mark the node as accessed. Callable under the shared lock; concurrent
    /// stores race benignly, any winner is enough.
    pub(crate) fn set_active(&self) {
        self.flags.fetch_or(NodeFlags::ACTIVE.bits(), Ordering::Release);
    }

    /// Read the activity bit. Requires the exclusive lock.
    pub(crate) fn is_active(&self) -> bool {
        self.flags.load(Ordering::Acquire) & NodeFlags::ACTIVE.bits() != 0
    }

    fn clear_active(&self) {
        self.flags.fetch_and(!NodeFlags::ACTIVE.bits(), Ordering::Release);
    }
}

/// How a walked node is dispatched by [`LruList::shrink`]: expiry wins over
/// activity, activity over idleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Expired,
    Active,
    Inactive,
}

/// Doubly linked list of [`Node`]s between two boxed sentinels.
pub(crate) struct LruList {
    size: u64,
    head: NonNull<Node>,
    tail: NonNull<Node>,
}

// Nodes are owned exclusively by the list; shared access from the cache only
// touches the atomic flags word.
unsafe impl Send for LruList {}
unsafe impl Sync for LruList {}

impl LruList {
    pub(crate) fn new() -> Self {
        let head = Node::sentinel();
        let tail = Node::sentinel();
        unsafe {
            (*head.as_ptr()).next = Some(tail);
            (*tail.as_ptr()).prev = Some(head);
        }
        Self { size: 0, head, tail }
    }

    /// Total size of owned nodes in bytes.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Splice `ptr` immediately before the tail sentinel, add its size, and
    /// clear its activity bit.
    pub(crate) fn push_back(&mut self, ptr: NonNull<Node>) {
        unsafe {
            let node = &mut *ptr.as_ptr();
            debug_assert!(node.prev.is_none() && node.next.is_none());

            node.clear_active();
            self.size += node.size();

            let mut last = self.tail.as_ref().prev.unwrap();
            last.as_mut().next = Some(ptr);
            node.prev = Some(last);
            node.next = Some(self.tail);
            self.tail.as_mut().prev = Some(ptr);
        }
    }

    /// Detach `ptr` from its neighbours and subtract its size.
    ///
    /// # Safety
    ///
    /// `ptr` must be owned by this list.
    pub(crate) unsafe fn remove(&mut self, ptr: NonNull<Node>) {
        let node = &mut *ptr.as_ptr();
        debug_assert!(node.item.is_some());

        let mut prev = node.prev.unwrap();
        let mut next = node.next.unwrap();
        prev.as_mut().next = Some(next);
        next.as_mut().prev = Some(prev);
        node.prev = None;
        node.next = None;

        self.size -= node.size();
    }

    /// Walk from the head, detaching nodes until `size <= target`. Each
    /// detached node is classified into a [`Verdict`] and handed to `f`
    /// together with this list, so `f` can re-attach it (here or elsewhere)
    /// or drop it. The list is well-formed before every call to `f`.
    ///
    /// # Panics
    ///
    /// Panics if the walk would step through the tail sentinel, which can
    /// only happen if size accounting is broken.
    pub(crate) fn shrink<F>(&mut self, target: u64, now: u64, mut f: F)
    where
        F: FnMut(&mut LruList, Verdict, NonNull<Node>),
    {
        while self.size > target {
            let ptr = unsafe { self.head.as_ref().next.unwrap() };
            assert!(ptr != self.tail, "lru shrink walked past the tail sentinel");

            let verdict = unsafe {
                self.remove(ptr);
                let node = ptr.as_ref();
                if node.expired(now) {
                    Verdict::Expired
                } else if node.is_active() {
                    Verdict::Active
                } else {
                    Verdict::Inactive
                }
            };
            f(self, verdict, ptr);
        }
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Node> {
        let mut cur = unsafe { self.head.as_ref().next.unwrap() };
        let tail = self.tail;
        std::iter::from_fn(move || {
            if cur == tail {
                return None;
            }
            let node = unsafe { &*cur.as_ptr() };
            cur = node.next.unwrap();
            Some(node)
        })
    }

    /// Walk both directions and recompute the size, panicking on any broken
    /// invariant.
    #[cfg(test)]
    pub(crate) fn validate(&self) {
        unsafe {
            let mut forward = 0u64;
            let mut cur = self.head;
            while let Some(next) = cur.as_ref().next {
                assert_eq!(next.as_ref().prev, Some(cur));
                if next != self.tail {
                    forward += next.as_ref().size();
                }
                cur = next;
            }
            assert_eq!(cur, self.tail);
            assert_eq!(forward, self.size);

            let mut cur = self.tail;
            while let Some(prev) = cur.as_ref().prev {
                assert_eq!(prev.as_ref().next, Some(cur));
                cur = prev;
            }
            assert_eq!(cur, self.head);
        }
    }
}

impl Drop for LruList {
    fn drop(&mut self) {
        // Real nodes are owned through the cache index and freed there; the
        // list itself owns only its sentinels.
        unsafe {
            drop(Box::from_raw(self.head.as_ptr()));
            drop(Box::from_raw(self.tail.as_ptr()));
        }
    }
}
