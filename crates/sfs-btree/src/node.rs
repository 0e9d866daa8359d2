//! In-memory btree node descriptors.
//!
//! A node carries its sorted key set, the packed format those keys are
//! stored under, its pointer key (position = `max_key`, value = replica
//! locations), and the bookkeeping the interior-update engine hangs off
//! it: write-blocked updates, the will-make-reachable backref, per-write
//! journal pins, and allocator open buckets.

use crate::lock::NodeLock;
use parking_lot::{Mutex, MutexGuard};
use sfs_alloc::OpenBucketId;
use sfs_journal::JournalPin;
use sfs_key::{KeyEntry, KeyFormat, KeyVal, KEY_U64S_FULL};
use sfs_types::{BtreeId, JournalSeq, KeyPos, Level, NodeSeq, UpdateId};
use std::sync::Arc;

/// Which sibling of a node, as an index into `sib_u64s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sibling {
    Prev = 0,
    Next = 1,
}

/// "No sibling on that side" marker in `sib_u64s`.
pub const SIB_U64S_NONE: u16 = u16::MAX;

/// One stored key plus whether it is packed under the node's format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: KeyEntry,
    pub packed: bool,
}

impl Entry {
    #[must_use]
    pub fn new(key: KeyEntry, format: &KeyFormat) -> Entry {
        let packed = format.key_u64s < KEY_U64S_FULL && format.can_pack(key.pos);
        Entry { key, packed }
    }

    /// Stored size under the node's format.
    #[must_use]
    pub fn u64s(&self, format: &KeyFormat) -> usize {
        let key_u64s = if self.packed {
            usize::from(format.key_u64s)
        } else {
            usize::from(KEY_U64S_FULL)
        };
        key_u64s + self.key.val.val_u64s()
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.key.val.is_whiteout()
    }
}

/// Cached key-count accounting, kept in sync with the entry set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeNr {
    pub live_u64s: usize,
    pub packed_keys: usize,
    pub unpacked_keys: usize,
}

/// The node's key range, format, and sorted key set.
#[derive(Debug, Clone)]
pub struct NodeData {
    pub min_key: KeyPos,
    pub max_key: KeyPos,
    pub format: KeyFormat,
    pub seq: NodeSeq,
    /// Lower bound on the journal seq covering this node's latest keys;
    /// recovery ignores journal entries at or below it.
    pub journal_seq: JournalSeq,
    pub entries: Vec<Entry>,
}

impl NodeData {
    #[must_use]
    pub fn empty(seq: NodeSeq) -> NodeData {
        NodeData {
            min_key: sfs_types::POS_MIN,
            max_key: sfs_types::POS_MAX,
            format: KeyFormat::FULL,
            seq,
            journal_seq: JournalSeq(0),
            entries: Vec::new(),
        }
    }

    /// Recompute accounting from scratch.
    #[must_use]
    pub fn compute_nr(&self) -> NodeNr {
        let mut nr = NodeNr::default();
        for e in &self.entries {
            if !e.is_live() {
                continue;
            }
            nr.live_u64s += e.u64s(&self.format);
            if e.packed {
                nr.packed_keys += 1;
            } else {
                nr.unpacked_keys += 1;
            }
        }
        nr
    }

    /// Total stored u64s including whiteouts (the raw bset size).
    #[must_use]
    pub fn set_u64s(&self) -> usize {
        self.entries.iter().map(|e| e.u64s(&self.format)).sum()
    }

    /// Insert `key` in sorted position. A key at an existing position
    /// replaces that entry (this is how a delete whites out a live key).
    pub fn insert_key(&mut self, key: KeyEntry) {
        let entry = Entry::new(key, &self.format);
        match self
            .entries
            .binary_search_by(|e| e.key.pos.cmp(&entry.key.pos))
        {
            Ok(i) => self.entries[i] = entry,
            Err(i) => self.entries.insert(i, entry),
        }
    }

    /// Live entries in position order.
    pub fn live_entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| e.is_live())
    }

    /// Append all live keys of `src`, re-packed under this node's
    /// format. Entries must arrive in ascending order of position.
    pub fn sort_in(&mut self, src: &NodeData) {
        for e in src.live_entries() {
            let last = self.entries.last().map(|l| l.key.pos);
            assert!(
                last.is_none_or(|p| p < e.key.pos),
                "sort_in input out of order"
            );
            self.entries.push(Entry::new(e.key.clone(), &self.format));
        }
    }

    /// Drop whiteouts in place.
    pub fn compact_whiteouts(&mut self) {
        self.entries.retain(Entry::is_live);
    }
}

/// Per-write journal pin slots. A node's unwritten dirty data pins the
/// journal entries it came from; the pin is dropped once that write is
/// durable.
#[derive(Debug, Default)]
pub struct NodeWrites {
    pins: [JournalPin; 2],
    current: usize,
}

impl NodeWrites {
    pub fn current_mut(&mut self) -> &mut JournalPin {
        &mut self.pins[self.current]
    }

    pub fn prev_mut(&mut self) -> &mut JournalPin {
        &mut self.pins[self.current ^ 1]
    }

    /// Flip writes: the in-flight write becomes the previous one.
    pub fn swap(&mut self) {
        self.current ^= 1;
    }
}

/// Backref from a pending new node to the update that will publish it.
/// `ref_held` mirrors whether the node still holds a reference on the
/// update's completion barrier (dropped when the node's write finishes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WillMakeReachable {
    pub update: UpdateId,
    pub ref_held: bool,
}

#[derive(Debug, Default)]
pub struct NodeFlags {
    pub dirty: bool,
    pub need_write: bool,
    pub dying: bool,
    pub fake: bool,
    pub accessed: bool,
    pub need_rewrite: bool,
    /// Set once the node's first (data-placing) write has completed.
    pub written: bool,
    /// A physical write has been handed to the device layer but not yet
    /// completed (held writes).
    pub write_in_flight: bool,
}

/// Everything mutable about a node, behind one mutex. The three-mode
/// [`NodeLock`] enforces the access protocol; this mutex makes the
/// individual field updates atomic.
pub struct NodeState {
    pub btree_id: BtreeId,
    pub level: Level,
    pub key: KeyEntry,
    pub hash_val: u64,
    pub data: NodeData,
    pub nr: NodeNr,
    pub flags: NodeFlags,
    pub sib_u64s: [u16; 2],
    pub write_blocked: Vec<UpdateId>,
    pub will_make_reachable: Option<WillMakeReachable>,
    pub open_buckets: Vec<OpenBucketId>,
    pub writes: NodeWrites,
}

impl NodeState {
    pub fn set_min(&mut self, pos: KeyPos) {
        if let KeyVal::Ptr(ptr) = &mut self.key.val {
            ptr.set_min_key(pos);
        }
        self.data.min_key = pos;
    }

    pub fn set_max(&mut self, pos: KeyPos) {
        self.key.pos = pos;
        self.data.max_key = pos;
    }

    /// Assert that children span exactly `[min_key, max_key]` with no
    /// gaps or overlaps. Only meaningful for interior nodes whose
    /// children carry v2 pointers.
    pub fn interior_verify(&self) {
        assert!(!self.level.is_leaf(), "interior verify on a leaf");
        let mut next = self.data.min_key;
        let mut last_pos = None;
        for e in self.data.live_entries() {
            if let Some(ptr) = e.key.as_btree_ptr() {
                if let Some(min_key) = ptr.min_key() {
                    assert!(
                        min_key == next,
                        "child gap/overlap: expected min {next}, found {min_key}"
                    );
                }
            }
            last_pos = Some(e.key.pos);
            if e.key.pos != sfs_types::POS_MAX {
                next = e.key.pos.successor();
            }
        }
        if let Some(last) = last_pos {
            assert!(
                last == self.data.max_key,
                "last child ends at {last}, node max is {}",
                self.data.max_key
            );
        }
    }
}

/// One btree node. Shared via `Arc`; the cache, paths, and updates all
/// hold references.
pub struct Node {
    pub lock: NodeLock,
    state: Mutex<NodeState>,
}

impl Node {
    #[must_use]
    pub fn new(btree_id: BtreeId, level: Level, key: KeyEntry, data: NodeData) -> Arc<Node> {
        let hash_val = key.as_btree_ptr().map_or(0, sfs_key::BtreePtr::hash_val);
        let nr = data.compute_nr();
        Arc::new(Node {
            lock: NodeLock::default(),
            state: Mutex::new(NodeState {
                btree_id,
                level,
                key,
                hash_val,
                data,
                nr,
                flags: NodeFlags::default(),
                sib_u64s: [0; 2],
                write_blocked: Vec::new(),
                will_make_reachable: None,
                open_buckets: Vec::new(),
                writes: NodeWrites::default(),
            }),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }

    #[must_use]
    pub fn level(&self) -> Level {
        self.state.lock().level
    }

    #[must_use]
    pub fn btree_id(&self) -> BtreeId {
        self.state.lock().btree_id
    }

    #[must_use]
    pub fn key(&self) -> KeyEntry {
        self.state.lock().key.clone()
    }

    #[must_use]
    pub fn hash_val(&self) -> u64 {
        self.state.lock().hash_val
    }

    #[must_use]
    pub fn data_seq(&self) -> NodeSeq {
        self.state.lock().data.seq
    }

    #[must_use]
    pub fn is_dying(&self) -> bool {
        self.state.lock().flags.dying
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("Node")
            .field("btree_id", &s.btree_id)
            .field("level", &s.level)
            .field("min", &s.data.min_key)
            .field("max", &s.data.max_key)
            .field("entries", &s.data.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_key::{BtreePtr, ExtentPtr, FormatState};
    use sfs_types::{DeviceIdx, SectorAddr, SectorCount};

    fn leaf_key(pos: KeyPos) -> KeyEntry {
        KeyEntry {
            pos,
            val: KeyVal::Opaque(vec![0xAA]),
        }
    }

    fn child_ptr(min: KeyPos, max: KeyPos) -> KeyEntry {
        KeyEntry::ptr(
            max,
            BtreePtr::V2 {
                ptrs: vec![ExtentPtr {
                    dev: DeviceIdx(0),
                    addr: SectorAddr(max.offset * 1000 + 64),
                }],
                min_key: min,
                seq: NodeSeq(1),
                sectors_written: SectorCount(0),
                sectors: SectorCount(16),
            },
        )
    }

    #[test]
    fn insert_key_keeps_sorted_order_and_replaces() {
        let mut d = NodeData::empty(NodeSeq(1));
        d.insert_key(leaf_key(KeyPos::new(2, 0)));
        d.insert_key(leaf_key(KeyPos::new(1, 0)));
        d.insert_key(leaf_key(KeyPos::new(3, 0)));
        assert_eq!(
            d.entries.iter().map(|e| e.key.pos).collect::<Vec<_>>(),
            vec![KeyPos::new(1, 0), KeyPos::new(2, 0), KeyPos::new(3, 0)]
        );

        d.insert_key(KeyEntry::whiteout(KeyPos::new(2, 0)));
        assert_eq!(d.entries.len(), 3);
        assert_eq!(d.live_entries().count(), 2);
    }

    #[test]
    fn nr_counts_live_u64s_under_format() {
        let mut s = FormatState::new();
        s.add_pos(KeyPos::new(1, 0));
        s.add_pos(KeyPos::new(1, 100));
        let f = s.done();
        assert!(f.key_u64s < KEY_U64S_FULL);

        let mut d = NodeData::empty(NodeSeq(1));
        d.format = f;
        d.insert_key(leaf_key(KeyPos::new(1, 5)));
        // Outside the format's range: stored unpacked.
        d.insert_key(leaf_key(KeyPos::new(9, 5)));

        let nr = d.compute_nr();
        assert_eq!(nr.packed_keys, 1);
        assert_eq!(nr.unpacked_keys, 1);
        assert_eq!(
            nr.live_u64s,
            usize::from(f.key_u64s) + 1 + usize::from(KEY_U64S_FULL) + 1
        );
    }

    #[test]
    fn interior_verify_accepts_contiguous_children() {
        let mut d = NodeData::empty(NodeSeq(1));
        d.insert_key(child_ptr(sfs_types::POS_MIN, KeyPos::new(2, 0)));
        d.insert_key(child_ptr(KeyPos::new(2, 1), KeyPos::new(5, 0)));
        d.max_key = KeyPos::new(5, 0);

        let node = Node::new(BtreeId::Extents, Level(1), child_ptr(sfs_types::POS_MIN, KeyPos::new(5, 0)), d);
        node.state().interior_verify();
    }

    #[test]
    #[should_panic(expected = "child gap/overlap")]
    fn interior_verify_rejects_gaps() {
        let mut d = NodeData::empty(NodeSeq(1));
        d.insert_key(child_ptr(sfs_types::POS_MIN, KeyPos::new(2, 0)));
        // Gap: next child should start at {2,1}.
        d.insert_key(child_ptr(KeyPos::new(3, 0), KeyPos::new(5, 0)));
        d.max_key = KeyPos::new(5, 0);

        let node = Node::new(BtreeId::Extents, Level(1), child_ptr(sfs_types::POS_MIN, KeyPos::new(5, 0)), d);
        node.state().interior_verify();
    }

    #[test]
    fn sort_in_skips_whiteouts() {
        let mut src = NodeData::empty(NodeSeq(1));
        src.insert_key(leaf_key(KeyPos::new(1, 0)));
        src.insert_key(KeyEntry::whiteout(KeyPos::new(2, 0)));
        src.insert_key(leaf_key(KeyPos::new(3, 0)));

        let mut dst = NodeData::empty(NodeSeq(2));
        dst.sort_in(&src);
        assert_eq!(dst.entries.len(), 2);
    }
}
