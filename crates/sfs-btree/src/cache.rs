//! Node cache: hash lookup by pointer, LRU reclaim, freeable pool,
//! and the cannibalize lock serialising bursts of node allocation.
//!
//! The cache is bounded: once it reaches capacity, allocating a new
//! descriptor cannibalises the least-recently-used clean node. Reclaim
//! is second-chance — a node with its accessed bit set survives one
//! sweep — and only ever takes nodes it can trylock exclusively, so a
//! node anyone is using (locked, dirty, pinned by an update) is never
//! reaped.

use crate::node::{Node, NodeData};
use asupersync::Cx;
use parking_lot::{Mutex, MutexGuard};
use sfs_error::{Result, StoreError};
use sfs_key::KeyEntry;
use sfs_types::{BtreeId, Level, NodeSeq};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Default cache bound, in nodes.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

#[derive(Default)]
struct CacheInner {
    /// Nodes by pointer hash.
    map: HashMap<u64, Arc<Node>>,
    /// Reclaim order, least recently inserted first; roots are removed
    /// from here.
    lru: Vec<u64>,
    /// Descriptors released back for reuse.
    freeable: Vec<Arc<Node>>,
}

/// The btree node cache. One per filesystem.
pub struct NodeCache {
    inner: Mutex<CacheInner>,
    cannibalize: Mutex<()>,
    capacity: usize,
}

impl NodeCache {
    #[must_use]
    pub fn new(capacity: usize) -> NodeCache {
        assert!(capacity > 0);
        NodeCache {
            inner: Mutex::new(CacheInner::default()),
            cannibalize: Mutex::new(()),
            capacity,
        }
    }

    /// Serialise node-descriptor allocation (and the LRU reaping it may
    /// do). Held for the duration of filling an update's reserve so one
    /// update's burst cannot starve another mid-fill.
    pub fn cannibalize_lock(&self, cx: &Cx, nowait: bool) -> Result<MutexGuard<'_, ()>> {
        if let Some(guard) = self.cannibalize.try_lock() {
            return Ok(guard);
        }
        if nowait {
            return Err(StoreError::WouldBlock);
        }
        cx.checkpoint().map_err(|_| StoreError::Cancelled)?;
        Ok(self.cannibalize.lock())
    }

    /// Obtain a node descriptor, locked intent+write. Recycles a
    /// retired descriptor slot when one is pending; otherwise, at
    /// capacity, cannibalises the LRU. The caller holds the cannibalize
    /// lock.
    ///
    /// The returned node has placeholder identity; the caller installs
    /// key, level, and data before publishing it.
    #[must_use]
    pub fn mem_alloc(&self, btree_id: BtreeId, level: Level) -> Arc<Node> {
        let need_reap = {
            // Retired descriptors are not reinitialised in place;
            // recycling one means dropping it in favour of a fresh
            // descriptor (old paths may still hold references).
            let mut inner = self.inner.lock();
            inner.freeable.pop().is_none() && inner.map.len() >= self.capacity
        };
        if need_reap {
            self.cannibalize_lru();
        }

        let node = Node::new(
            btree_id,
            level,
            KeyEntry::whiteout(sfs_types::POS_MIN),
            NodeData::empty(NodeSeq(0)),
        );
        node.lock.lock_intent();
        node.lock.lock_write();
        node
    }

    /// Reap one clean node off the LRU. First sweep clears accessed
    /// bits (second chance); the next takes the oldest candidate that
    /// can be locked exclusively. May reap nothing if every cached node
    /// is in use.
    fn cannibalize_lru(&self) {
        for pass in 0..2 {
            let candidates: Vec<u64> = self.inner.lock().lru.clone();
            for hash in candidates {
                let Some(node) = self.inner.lock().map.get(&hash).cloned() else {
                    continue;
                };
                if self.try_reclaim(&node, pass == 0) {
                    trace!(
                        target: "sfs::btree::cache",
                        event = "cannibalize",
                        hash = hash
                    );
                    return;
                }
            }
        }
    }

    /// Evict `node` if nothing holds it: trylock intent+write, then
    /// check it is clean and unpinned. With `second_chance`, a node
    /// with its accessed bit set is spared once instead.
    fn try_reclaim(&self, node: &Arc<Node>, second_chance: bool) -> bool {
        if !node.lock.try_lock_intent() {
            return false;
        }
        if !node.lock.try_lock_write() {
            node.lock.unlock_intent();
            return false;
        }

        let evict = {
            let mut s = node.state();
            if second_chance && s.flags.accessed {
                s.flags.accessed = false;
                false
            } else {
                !s.flags.dirty
                    && !s.flags.need_write
                    && !s.flags.dying
                    && s.write_blocked.is_empty()
                    && s.will_make_reachable.is_none()
                    && s.open_buckets.is_empty()
            }
        };

        if evict {
            let hash = node.hash_val();
            let mut inner = self.inner.lock();
            if inner
                .map
                .get(&hash)
                .is_some_and(|found| Arc::ptr_eq(found, node))
            {
                inner.map.remove(&hash);
            }
            inner.lru.retain(|&h| h != hash);
        }

        node.lock.unlock_write();
        node.lock.unlock_intent();
        evict
    }

    /// Publish `node` under its pointer hash.
    ///
    /// Panics on a hash collision with a live different node; replacing
    /// the same node (rehash after a key update) is allowed.
    pub fn hash_insert(&self, node: &Arc<Node>) {
        let hash = node.hash_val();
        let mut inner = self.inner.lock();
        let prev = inner.map.insert(hash, Arc::clone(node));
        assert!(
            prev.is_none() || Arc::ptr_eq(&prev.expect("checked"), node),
            "node cache hash collision at {hash:#x}"
        );
        if !inner.lru.contains(&hash) {
            inner.lru.push(hash);
        }
        trace!(target: "sfs::btree::cache", event = "hash_insert", hash = hash);
    }

    pub fn hash_remove(&self, node: &Arc<Node>) {
        let hash = node.hash_val();
        let mut inner = self.inner.lock();
        if let Some(found) = inner.map.get(&hash) {
            if Arc::ptr_eq(found, node) {
                inner.map.remove(&hash);
            }
        }
        inner.lru.retain(|&h| h != hash);
    }

    /// Look up a node by pointer hash.
    #[must_use]
    pub fn lookup(&self, hash: u64) -> Option<Arc<Node>> {
        self.inner.lock().map.get(&hash).cloned()
    }

    /// Roots cannot be reaped: drop the node from the LRU.
    pub fn lru_remove(&self, node: &Arc<Node>) {
        let hash = node.hash_val();
        self.inner.lock().lru.retain(|&h| h != hash);
    }

    /// Move a retired descriptor to the freeable pool.
    pub fn freeable_push(&self, node: Arc<Node>) {
        self.inner.lock().freeable.push(node);
    }

    #[must_use]
    pub fn nr_cached(&self) -> usize {
        self.inner.lock().map.len()
    }

    #[must_use]
    pub fn nr_freeable(&self) -> usize {
        self.inner.lock().freeable.len()
    }
}

impl Default for NodeCache {
    fn default() -> NodeCache {
        NodeCache::new(DEFAULT_CACHE_CAPACITY)
    }
}
