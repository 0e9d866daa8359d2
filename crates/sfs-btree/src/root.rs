//! Per-btree root registry.
//!
//! The registry holds the current root node (and its pointer key) for
//! each btree id. Every journal commit carries a complete root
//! snapshot, so recovery can rebuild the registry from any single
//! commit record; `merge_root_entries` / `entries_to_roots` move roots
//! across that boundary.

use crate::fs::Fs;
use crate::interior::{self, InteriorUpdate};
use crate::node::{Node, SIB_U64S_NONE};
use asupersync::Cx;
use parking_lot::Mutex;
use sfs_error::Result;
use sfs_journal::JournalEntry;
use sfs_key::{BtreePtr, ExtentPtr, KeyEntry};
use sfs_types::{
    BtreeId, DeviceIdx, KeyPos, Level, SectorAddr, BTREE_ID_NR, POS_MAX, POS_MIN,
};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
struct RootSlot {
    node: Option<Arc<Node>>,
    key: Option<KeyEntry>,
    level: Level,
    alive: bool,
}

/// Roots for every btree id, under one mutex.
pub struct RootRegistry {
    slots: Mutex<[RootSlot; BTREE_ID_NR]>,
}

impl RootRegistry {
    #[must_use]
    pub fn new() -> RootRegistry {
        RootRegistry {
            slots: Mutex::new(Default::default()),
        }
    }

    #[must_use]
    pub fn root_node(&self, id: BtreeId) -> Option<Arc<Node>> {
        self.slots.lock()[id.index()].node.clone()
    }

    #[must_use]
    pub fn root_key(&self, id: BtreeId) -> Option<KeyEntry> {
        self.slots.lock()[id.index()].key.clone()
    }

    #[must_use]
    pub fn alive(&self, id: BtreeId) -> bool {
        self.slots.lock()[id.index()].alive
    }

    /// Append a `BtreeRoot` entry for every alive root not already
    /// present in `entries`, producing a complete snapshot.
    #[must_use]
    pub fn merge_root_entries(&self, mut entries: Vec<JournalEntry>) -> Vec<JournalEntry> {
        let have: Vec<BtreeId> = entries
            .iter()
            .filter(|e| matches!(e, JournalEntry::BtreeRoot { .. }))
            .map(JournalEntry::btree_id)
            .collect();

        let slots = self.slots.lock();
        for id in BtreeId::ALL {
            let slot = &slots[id.index()];
            if slot.alive && !have.contains(&id) {
                let key = slot.key.clone().expect("alive root has a key");
                entries.push(JournalEntry::BtreeRoot {
                    btree_id: id,
                    level: slot.level,
                    key,
                });
            }
        }
        entries
    }

    /// Install root keys parsed out of a journal record (recovery).
    pub fn entries_to_roots(&self, entries: &[JournalEntry]) {
        let mut slots = self.slots.lock();
        for e in entries {
            if let JournalEntry::BtreeRoot {
                btree_id,
                level,
                key,
            } = e
            {
                let slot = &mut slots[btree_id.index()];
                slot.key = Some(key.clone());
                slot.level = *level;
                slot.alive = true;
                slot.node = None;
            }
        }
    }
}

impl Default for RootRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Publish `b` as its btree's root in memory. Roots cannot be reaped,
/// and the tree only ever grows from the top: a new root below the old
/// one is a bug unless the old root is already dying.
pub fn set_root_inmem(fs: &Fs, b: &Arc<Node>) {
    fs.cache.lru_remove(b);

    let mut slots = fs.roots.slots.lock();
    let bs = b.state();
    let slot = &mut slots[bs.btree_id.index()];
    if let Some(old) = &slot.node {
        assert!(
            bs.level >= old.level() || old.is_dying(),
            "root would shrink the tree"
        );
    }
    slot.node = Some(Arc::clone(b));
    slot.key = Some(bs.key.clone());
    slot.level = bs.level;
    slot.alive = true;
    debug!(
        target: "sfs::btree::root",
        event = "set_root",
        btree = %bs.btree_id,
        level = bs.level.0
    );
}

/// Update the root in memory and queue the journal entry making it
/// real. The caller must hold intent on the old root and no write
/// locks; the old root is write-locked for the switchover so nobody
/// observes it mid-swap.
pub fn set_root(fs: &Fs, update: &Arc<InteriorUpdate>, b: &Arc<Node>) {
    {
        let bs = b.state();
        assert!(
            bs.flags.written || fs.writes_held() || fs.journal.error(),
            "publishing an unwritten root"
        );
    }

    let old = fs.roots.root_node(b.btree_id());
    if let Some(old) = &old {
        old.lock.lock_write();
    }

    set_root_inmem(fs, b);
    interior::updated_root(fs, update, b);

    // The new root is not persistent yet, but that's fine: we hold
    // intent on it, and anything depending on it would have to go
    // through it.
    if let Some(old) = &old {
        old.lock.unlock_write();
    }
}

/// A root's pointer key changed in place (pointer update on the root);
/// refresh the registry's cached copy so the next snapshot journals the
/// new key.
pub fn refresh_root_key(fs: &Fs, b: &Arc<Node>) {
    let mut slots = fs.roots.slots.lock();
    let bs = b.state();
    let slot = &mut slots[bs.btree_id.index()];
    if slot.node.as_ref().is_some_and(|n| Arc::ptr_eq(n, b)) {
        slot.key = Some(bs.key.clone());
    }
}

/// Recovery: install a root read back from the journal.
pub fn set_root_for_read(fs: &Fs, b: &Arc<Node>) {
    assert!(
        fs.roots.root_node(b.btree_id()).is_none(),
        "root already installed"
    );
    set_root_inmem(fs, b);
}

/// Bringup (mkfs): install a fake empty leaf root for `id`. The node is
/// flagged fake (no backing extent; never written) and need-rewrite, so
/// the first insert replaces it with a real node.
pub fn root_alloc(fs: &Fs, id: BtreeId, cx: &Cx) -> Result<Arc<Node>> {
    let _guard = fs.cache.cannibalize_lock(cx, false)?;
    let b = fs.cache.mem_alloc(id, Level(0));

    {
        let mut bs = b.state();
        bs.btree_id = id;
        bs.level = Level(0);
        bs.flags.fake = true;
        bs.flags.need_rewrite = true;
        bs.sib_u64s = [SIB_U64S_NONE; 2];

        // A sentinel pointer so the node can live in the hash table.
        bs.key = KeyEntry::ptr(
            POS_MAX,
            BtreePtr::V1 {
                ptrs: vec![ExtentPtr {
                    dev: DeviceIdx(u8::MAX),
                    addr: SectorAddr(u64::from(u32::MAX) - id.index() as u64),
                }],
            },
        );
        bs.hash_val = bs.key.as_btree_ptr().expect("just built").hash_val();

        bs.data = crate::node::NodeData::empty(fs.next_node_seq());
        bs.data.min_key = POS_MIN;
        bs.data.max_key = POS_MAX;
        bs.nr = Default::default();
    }

    fs.cache.hash_insert(&b);
    set_root_inmem(fs, &b);

    b.lock.unlock_write();
    b.lock.unlock_intent();
    info!(target: "sfs::btree::root", event = "root_alloc", btree = %id);
    Ok(b)
}

/// Read every btree's tree back from a recovered root set (tests and
/// recovery verification): walks the on-disk pointers and returns the
/// root node of `id` with its children reachable through the cache.
pub fn read_tree(fs: &Fs, cx: &Cx, id: BtreeId) -> Result<Option<Arc<Node>>> {
    let Some(key) = fs.roots.root_key(id) else {
        return Ok(None);
    };
    let level = {
        let slots = fs.roots.slots.lock();
        slots[id.index()].level
    };
    let root = crate::path::node_get(fs, cx, &key, level)?;
    if fs.roots.root_node(id).is_none() {
        set_root_for_read(fs, &root);
    } else {
        let mut slots = fs.roots.slots.lock();
        slots[id.index()].node = Some(Arc::clone(&root));
        drop(slots);
        fs.cache.lru_remove(&root);
    }
    read_children(fs, cx, &root)?;
    Ok(Some(root))
}

fn read_children(fs: &Fs, cx: &Cx, b: &Arc<Node>) -> Result<()> {
    if b.level().is_leaf() {
        return Ok(());
    }
    let child_keys: Vec<KeyEntry> = {
        let bs = b.state();
        bs.data
            .live_entries()
            .map(|e| e.key.clone())
            .collect()
    };
    for key in child_keys {
        let child = crate::path::node_get(fs, cx, &key, Level(b.level().0 - 1))?;
        read_children(fs, cx, &child)?;
    }
    Ok(())
}

/// Verify a whole tree: child spans are exact and contiguous at every
/// interior node. Panics on violation.
pub fn verify_tree(fs: &Fs, cx: &Cx, root: &Arc<Node>) -> Result<()> {
    if root.level().is_leaf() {
        return Ok(());
    }
    {
        root.state().interior_verify();
    }
    let child_keys: Vec<(KeyEntry, KeyPos)> = {
        let bs = root.state();
        let mut expect_min = bs.data.min_key;
        let mut out = Vec::new();
        for e in bs.data.live_entries() {
            out.push((e.key.clone(), expect_min));
            if e.key.pos != POS_MAX {
                expect_min = e.key.pos.successor();
            }
        }
        out
    };
    for (key, expect_min) in child_keys {
        let child = crate::path::node_get(fs, cx, &key, Level(root.level().0 - 1))?;
        {
            let cs = child.state();
            assert!(
                cs.data.min_key == expect_min,
                "child min {} != expected {expect_min}",
                cs.data.min_key
            );
            assert!(
                cs.data.max_key == key.pos,
                "child max {} != pointer pos {}",
                cs.data.max_key,
                key.pos
            );
        }
        verify_tree(fs, cx, &child)?;
    }
    Ok(())
}
