//! Lock paths through the tree.
//!
//! A `Path` holds one node per level from the leaf (or target level) up
//! to the root, all intent-locked. Topology changes require the caller
//! to come in with such a path; after a change the engine splices the
//! replacement nodes in and drops the retired ones.
//!
//! The unlock/relock pair exists for blocking resource acquisition:
//! release every lock, wait, then relock and check nothing moved
//! underneath (a freed or rewritten node fails the relock and the
//! caller restarts its transaction).

use crate::fs::Fs;
use crate::io;
use crate::node::Node;
use asupersync::Cx;
use sfs_error::{Result, StoreError};
use sfs_key::KeyEntry;
use sfs_types::{BtreeId, KeyPos, Level, NodeSeq, MAX_DEPTH};
use std::sync::Arc;
use tracing::trace;

struct PathLevel {
    node: Arc<Node>,
    seq: NodeSeq,
}

pub struct Path {
    btree_id: BtreeId,
    levels: Vec<Option<PathLevel>>,
    locked: bool,
}

/// Find `key`'s node in the cache, reading it from disk on a miss.
pub fn node_get(fs: &Fs, cx: &Cx, key: &KeyEntry, expect_level: Level) -> Result<Arc<Node>> {
    let ptr = key.as_btree_ptr().ok_or_else(|| StoreError::Corruption {
        location: format!("key {}", key.pos),
        detail: "child entry with no pointer".to_owned(),
    })?;
    if let Some(node) = fs.cache.lookup(ptr.hash_val()) {
        node.state().flags.accessed = true;
        return Ok(node);
    }

    let (btree_id, level, data) = io::node_read_data(fs, cx, key)?;
    if level != expect_level {
        return Err(StoreError::Corruption {
            location: format!("key {}", key.pos),
            detail: format!("expected level {}, node is level {}", expect_level.0, level.0),
        });
    }
    let mut node_key = key.clone();
    node_key.pos = data.max_key;
    let node = Node::new(btree_id, level, node_key, data);
    node.state().flags.written = true;
    fs.cache.hash_insert(&node);
    trace!(
        target: "sfs::btree::cache",
        event = "node_fill",
        level = level.0,
        max_key = %node.state().data.max_key
    );
    Ok(node)
}

impl Path {
    /// Walk from the root down to `target_level`, taking intent locks
    /// top-down on every level touched.
    pub fn traverse(
        fs: &Fs,
        cx: &Cx,
        btree_id: BtreeId,
        pos: KeyPos,
        target_level: Level,
    ) -> Result<Path> {
        let root = fs
            .roots
            .root_node(btree_id)
            .ok_or_else(|| StoreError::Corruption {
                location: format!("btree {btree_id}"),
                detail: "no root installed".to_owned(),
            })?;

        let mut path = Path {
            btree_id,
            levels: (0..usize::from(MAX_DEPTH)).map(|_| None).collect(),
            locked: true,
        };

        root.lock.lock_intent();
        let mut cur = root;
        loop {
            let level = cur.level();
            path.levels[usize::from(level.0)] = Some(PathLevel {
                seq: cur.data_seq(),
                node: Arc::clone(&cur),
            });
            if level == target_level || level.is_leaf() {
                break;
            }

            let child_key = {
                let s = cur.state();
                let found = s
                    .data
                    .live_entries()
                    .find(|e| e.key.pos >= pos)
                    .map(|e| e.key.clone());
                match found {
                    Some(key) => key,
                    None => {
                        return Err(StoreError::Corruption {
                            location: format!("node {}", s.data.max_key),
                            detail: format!("no child covers {pos}"),
                        });
                    }
                }
            };
            let child = node_get(fs, cx, &child_key, Level(level.0 - 1))?;
            child.lock.lock_intent();
            cur = child;
        }
        Ok(path)
    }

    #[must_use]
    pub fn btree_id(&self) -> BtreeId {
        self.btree_id
    }

    #[must_use]
    pub fn node(&self, level: Level) -> Option<Arc<Node>> {
        self.levels[usize::from(level.0)]
            .as_ref()
            .map(|l| Arc::clone(&l.node))
    }

    /// The parent of `b` on this path, if any.
    #[must_use]
    pub fn parent_of(&self, b: &Arc<Node>) -> Option<Arc<Node>> {
        let parent_level = b.level().parent();
        if usize::from(parent_level.0) >= self.levels.len() {
            return None;
        }
        self.node(parent_level)
    }

    /// Highest level this path holds a node at.
    #[must_use]
    pub fn top_level(&self) -> Option<Level> {
        (0..self.levels.len())
            .rev()
            .find(|&l| self.levels[l].is_some())
            .map(|l| Level(u8::try_from(l).expect("depth fits u8")))
    }

    /// Remove `b` from the path, releasing the path's intent reference.
    pub fn node_drop(&mut self, b: &Arc<Node>) {
        let slot = &mut self.levels[usize::from(b.level().0)];
        if let Some(l) = slot {
            if Arc::ptr_eq(&l.node, b) {
                *slot = None;
                b.lock.unlock_intent();
            }
        }
    }

    /// Install `b` at its level, taking an intent reference for the
    /// path (the caller keeps its own lock).
    pub fn node_replace(&mut self, b: &Arc<Node>) {
        b.lock.increment_intent();
        let slot = &mut self.levels[usize::from(b.level().0)];
        if let Some(old) = slot.take() {
            old.node.lock.unlock_intent();
        }
        *slot = Some(PathLevel {
            seq: b.data_seq(),
            node: Arc::clone(b),
        });
    }

    /// All levels still point at live nodes.
    #[must_use]
    pub fn upgrade(&self) -> bool {
        self.locked
            && self
                .levels
                .iter()
                .flatten()
                .all(|l| !l.node.is_dying() && l.node.data_seq() == l.seq)
    }

    /// Release every lock (for a blocking wait), keeping node refs so
    /// [`Path::relock`] can try to pick up where it left off.
    pub fn unlock(&mut self) {
        if !self.locked {
            return;
        }
        for l in self.levels.iter().flatten() {
            l.node.lock.unlock_intent();
        }
        self.locked = false;
    }

    /// Reacquire the locks dropped by [`Path::unlock`]. Fails if any
    /// node died or was rewritten while unlocked; the caller must then
    /// restart with a fresh traverse.
    #[must_use]
    pub fn relock(&mut self) -> bool {
        if self.locked {
            return true;
        }
        let mut taken = Vec::new();
        // Same top-down order as traverse.
        for l in self.levels.iter().rev().flatten() {
            l.node.lock.lock_intent();
            taken.push(Arc::clone(&l.node));
            if l.node.is_dying() || l.node.data_seq() != l.seq {
                for n in &taken {
                    n.lock.unlock_intent();
                }
                return false;
            }
        }
        self.locked = true;
        true
    }
}

impl Drop for Path {
    fn drop(&mut self) {
        if self.locked {
            for l in self.levels.iter().flatten() {
                l.node.lock.unlock_intent();
            }
        }
    }
}
