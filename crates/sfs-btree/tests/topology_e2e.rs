//! End-to-end topology scenarios: root split, foreground merge, rewrite
//! under GC pressure, format fallback, and allocator accounting.

mod common;

use common::*;
use sfs_btree::node::Sibling;
use sfs_btree::{interior, root, topology, Path};
use sfs_journal::JournalEntry;
use sfs_key::KeyVal;
use sfs_types::{KeyPos, Level, POS_MAX, POS_MIN};

#[test]
fn root_split_grows_tree_by_one_level() {
    let (fs, _device, cx) = mount_small();
    mkfs(&fs, &cx);

    // Five fat keys at {0,0}..{4,0}: 5 * (3 + 38) = 205 u64s, past the
    // split threshold of 160.
    {
        let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
        let leaf = path.node(Level(0)).unwrap();
        for inode in 0..5 {
            leaf_insert(&leaf, KeyPos::new(inode, 0), 38);
        }
        topology::split_leaf(&fs, &cx, &mut path, 0).unwrap();
    }
    fs.flush_interior_updates();

    // The tree grew: a level-1 root over two leaves.
    let new_root = fs.roots.root_node(TEST_BTREE).unwrap();
    assert_eq!(new_root.level(), Level(1));
    {
        let rs = new_root.state();
        assert_eq!(rs.data.min_key, POS_MIN);
        assert_eq!(rs.data.max_key, POS_MAX);
        let children: Vec<KeyPos> = rs.data.live_entries().map(|e| e.key.pos).collect();
        assert_eq!(children.len(), 2);
        // 3/5 pivot over five equal keys lands after the third.
        assert_eq!(children[0], KeyPos::new(2, 0));
        assert_eq!(children[1], POS_MAX);
    }
    verify(&fs, &cx);

    // Both halves still hold every key.
    let keys = live_leaf_positions(&fs, &cx);
    assert_eq!(keys, (0..5).map(|i| KeyPos::new(i, 0)).collect::<Vec<_>>());

    // The journal's latest commit carries a btree_root entry pointing
    // at the new level-1 root.
    let records = fs.journal.records();
    let last = records.last().unwrap();
    let has_root = last.entries.iter().any(|e| {
        matches!(e, JournalEntry::BtreeRoot { btree_id, level, .. }
            if *btree_id == TEST_BTREE && *level == Level(1))
    });
    assert!(has_root, "last commit must carry the new root");

    assert_eq!(interior::updates_nr_pending(&fs), 0);
    fs.unmount();
}

#[test]
fn foreground_merge_prev_collapses_siblings() {
    let (fs, _device, cx) = mount_small();
    mkfs(&fs, &cx);

    // Build two leaves via a root split.
    {
        let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
        let leaf = path.node(Level(0)).unwrap();
        for inode in 0..5 {
            leaf_insert(&leaf, KeyPos::new(inode, 0), 38);
        }
        topology::split_leaf(&fs, &cx, &mut path, 0).unwrap();
    }
    fs.flush_interior_updates();
    assert_eq!(count_tree_nodes(&fs, &cx), 3);

    // Shrink the right leaf until the joint size is under the merge
    // threshold (80 u64s), then nudge its sibling estimate the way the
    // insert path would.
    {
        let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MAX, Level(0)).unwrap();
        let right = path.node(Level(0)).unwrap();
        right.lock.lock_write();
        {
            let mut rs = right.state();
            rs.data.entries.retain(|e| e.key.pos.inode >= 4);
            rs.data
                .entries
                .iter_mut()
                .for_each(|e| match &mut e.key.val {
                    KeyVal::Opaque(words) => words.truncate(4),
                    _ => {}
                });
            rs.nr = rs.data.compute_nr();
            rs.flags.dirty = true;
            rs.flags.need_write = true;
            let live = u16::try_from(rs.nr.live_u64s).unwrap();
            rs.sib_u64s = [live, live];
        }
        right.lock.unlock_write();

        // Same shrink on the left leaf.
        let left = {
            let root_node = path.node(Level(1)).unwrap();
            let key = root_node
                .state()
                .data
                .live_entries()
                .next()
                .unwrap()
                .key
                .clone();
            sfs_btree::path::node_get(&fs, &cx, &key, Level(0)).unwrap()
        };
        left.lock.lock_write();
        {
            let mut ls = left.state();
            ls.data.entries.iter_mut().for_each(|e| match &mut e.key.val {
                KeyVal::Opaque(words) => words.truncate(4),
                _ => {}
            });
            ls.nr = ls.data.compute_nr();
            ls.flags.dirty = true;
            ls.flags.need_write = true;
        }
        left.lock.unlock_write();

        topology::maybe_merge_sibling(&fs, &cx, &mut path, Level(0), Sibling::Prev, 0);
    }
    fs.flush_interior_updates();

    // One leaf again, spanning the whole range, with all surviving keys
    // ({3,0} was deleted while shrinking the right leaf).
    assert_eq!(count_tree_nodes(&fs, &cx), 2);
    verify(&fs, &cx);
    let keys = live_leaf_positions(&fs, &cx);
    assert_eq!(
        keys,
        vec![
            KeyPos::new(0, 0),
            KeyPos::new(1, 0),
            KeyPos::new(2, 0),
            KeyPos::new(4, 0)
        ]
    );

    // The parent update was a delete of the old covering pointer plus
    // an insert of the merged node's pointer.
    let records = fs.journal.records();
    let merged_commit = records
        .iter()
        .rev()
        .find(|r| {
            r.entries
                .iter()
                .any(|e| matches!(e, JournalEntry::BtreeKeys { key, .. } if key.val.is_whiteout()))
        })
        .expect("merge journalled a delete");
    let whiteout_pos = merged_commit
        .entries
        .iter()
        .find_map(|e| match e {
            JournalEntry::BtreeKeys { key, .. } if key.val.is_whiteout() => Some(key.pos),
            _ => None,
        })
        .unwrap();
    // The deleted pointer is the one that covered the previous leaf.
    assert_eq!(whiteout_pos, KeyPos::new(2, 0));

    fs.unmount();
}

#[test]
fn merge_at_tree_edge_records_no_sibling() {
    let (fs, _device, cx) = mount_small();
    mkfs(&fs, &cx);

    {
        let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
        let leaf = path.node(Level(0)).unwrap();
        for inode in 0..5 {
            leaf_insert(&leaf, KeyPos::new(inode, 0), 38);
        }
        topology::split_leaf(&fs, &cx, &mut path, 0).unwrap();
    }
    fs.flush_interior_updates();

    // The left leaf has no previous sibling.
    let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
    let left = path.node(Level(0)).unwrap();
    left.state().sib_u64s[0] = 10;
    topology::maybe_merge_sibling(&fs, &cx, &mut path, Level(0), Sibling::Prev, 0);
    assert_eq!(left.state().sib_u64s[0], u16::MAX);
    drop(path);

    assert_eq!(count_tree_nodes(&fs, &cx), 3);
    fs.unmount();
}

#[test]
fn need_rewrite_forces_split_path_on_insert() {
    let (fs, _device, cx) = mount_small();
    mkfs(&fs, &cx);

    {
        let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
        let leaf = path.node(Level(0)).unwrap();
        for inode in 0..5 {
            leaf_insert(&leaf, KeyPos::new(inode, 0), 38);
        }
        topology::split_leaf(&fs, &cx, &mut path, 0).unwrap();
    }
    fs.flush_interior_updates();

    let old_root = fs.roots.root_node(TEST_BTREE).unwrap();
    let old_seq = old_root.data_seq();
    topology::set_need_rewrite(&old_root);
    let freeable_before = fs.cache.nr_freeable();

    // Rewriting a child inserts into the root; the root has plenty of
    // room, but need_rewrite forces the split (compact) path, giving it
    // a fresh location.
    {
        let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
        let leaf = path.node(Level(0)).unwrap();
        let leaf_seq = leaf.data_seq();
        topology::node_rewrite(&fs, &cx, &mut path, Level(0), leaf_seq, 0).unwrap();
    }
    fs.flush_interior_updates();

    let new_root = fs.roots.root_node(TEST_BTREE).unwrap();
    assert!(!std::sync::Arc::ptr_eq(&new_root, &old_root));
    assert_eq!(new_root.level(), Level(1));
    assert!(new_root.data_seq() > old_seq);
    assert!(fs.cache.nr_freeable() > freeable_before);

    // Same key set, fresh locations, invariants intact.
    verify(&fs, &cx);
    let keys = live_leaf_positions(&fs, &cx);
    assert_eq!(keys.len(), 5);
    fs.unmount();
}

#[test]
fn rewrite_keeps_source_format_when_repack_would_overflow() {
    let (fs, _device, cx) = mount_small();
    mkfs(&fs, &cx);

    let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
    let leaf = path.node(Level(0)).unwrap();

    // Shape the leaf exactly like the planner's overflow case: a narrow
    // format packing 117 keys at 2 u64s, plus one outlier that forces
    // the recomputed format to 3 u64s per key.
    leaf.lock.lock_write();
    {
        let mut ls = leaf.state();
        let mut s = sfs_key::FormatState::new();
        s.add_pos(KeyPos::new(0, 0));
        s.add_pos(KeyPos::new(0, (1 << 40) - 1));
        ls.data.format = s.done();
        for k in 0..117 {
            ls.data.insert_key(sfs_key::KeyEntry {
                pos: KeyPos::new(0, k),
                val: KeyVal::Opaque(vec![]),
            });
        }
        ls.data.insert_key(sfs_key::KeyEntry {
            pos: KeyPos::new(1, 1 << 63),
            val: KeyVal::Opaque(vec![]),
        });
        ls.nr = ls.data.compute_nr();
        ls.flags.dirty = true;
        ls.flags.need_write = true;
    }
    leaf.lock.unlock_write();
    let source_format = leaf.state().data.format;
    let leaf_seq = leaf.data_seq();

    topology::node_rewrite(&fs, &cx, &mut path, Level(0), leaf_seq, 0).unwrap();
    let replacement = path.node(Level(0)).unwrap();
    assert_eq!(replacement.state().data.format, source_format);
    assert_eq!(replacement.state().nr.live_u64s, 117 * 2 + 3);
    drop(path);

    fs.flush_interior_updates();
    fs.unmount();
}

#[test]
fn allocator_accounting_matches_reachable_pointer_set() {
    let (fs, _device, cx) = mount_small();
    mkfs(&fs, &cx);

    {
        let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
        let leaf = path.node(Level(0)).unwrap();
        for inode in 0..5 {
            leaf_insert(&leaf, KeyPos::new(inode, 0), 38);
        }
        topology::split_leaf(&fs, &cx, &mut path, 0).unwrap();
    }
    fs.flush_interior_updates();

    // Rewrite a leaf a couple of times; every insert is eventually
    // cancelled by an overwrite except the live set.
    for _ in 0..2 {
        let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
        let leaf = path.node(Level(0)).unwrap();
        let seq = leaf.data_seq();
        topology::node_rewrite(&fs, &cx, &mut path, Level(0), seq, 0).unwrap();
        drop(path);
        fs.flush_interior_updates();
    }

    let reachable = count_tree_nodes(&fs, &cx);
    assert_eq!(fs.replicas.live_extents(), reachable);

    // Every pending update released its pins.
    assert_eq!(fs.journal.oldest_pinned(), None);
    assert_eq!(interior::updates_nr_pending(&fs), 0);
    fs.unmount();
}

#[test]
fn update_key_replaces_root_pointer_in_place() {
    let (fs, _device, cx) = mount_small();
    mkfs(&fs, &cx);

    let root_node = fs.roots.root_node(TEST_BTREE).unwrap();
    let old_key = root_node.key();
    let mut new_key = old_key.clone();
    if let KeyVal::Ptr(ptr) = &mut new_key.val {
        // Pretend a replica moved: same position, different sector.
        ptr.ptrs_mut()[0].addr = sfs_types::SectorAddr(ptr.ptrs()[0].addr.0 + 4096);
    }

    {
        let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
        let b = path.node(Level(0)).unwrap();
        topology::node_update_key(&fs, &cx, &mut path, &b, new_key.clone()).unwrap();
    }
    fs.flush_interior_updates();

    let root_node = fs.roots.root_node(TEST_BTREE).unwrap();
    assert_eq!(root_node.key(), new_key);
    assert_eq!(fs.roots.root_key(TEST_BTREE).unwrap(), new_key);
    // Lookups find the node under the new pointer hash.
    let hash = new_key.as_btree_ptr().unwrap().hash_val();
    assert!(fs.cache.lookup(hash).is_some());

    // The journal saw the root change.
    let records = fs.journal.records();
    let last_root = records
        .iter()
        .rev()
        .find_map(|r| {
            r.entries.iter().find_map(|e| match e {
                JournalEntry::BtreeRoot { btree_id, key, .. } if *btree_id == TEST_BTREE => {
                    Some(key.clone())
                }
                _ => None,
            })
        })
        .unwrap();
    assert_eq!(last_root, new_key);
    fs.unmount();
}

#[test]
fn update_key_on_child_swaps_hash_through_alias() {
    let (fs, _device, cx) = mount_small();
    mkfs(&fs, &cx);

    {
        let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
        let leaf = path.node(Level(0)).unwrap();
        for inode in 0..5 {
            leaf_insert(&leaf, KeyPos::new(inode, 0), 38);
        }
        topology::split_leaf(&fs, &cx, &mut path, 0).unwrap();
    }
    fs.flush_interior_updates();

    let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
    let leaf = path.node(Level(0)).unwrap();
    let old_key = leaf.key();
    let old_hash = old_key.as_btree_ptr().unwrap().hash_val();

    let mut new_key = old_key.clone();
    if let KeyVal::Ptr(ptr) = &mut new_key.val {
        ptr.ptrs_mut()[0].addr = sfs_types::SectorAddr(ptr.ptrs()[0].addr.0 + 8192);
    }
    let new_hash = new_key.as_btree_ptr().unwrap().hash_val();
    assert_ne!(old_hash, new_hash);

    topology::node_update_key(&fs, &cx, &mut path, &leaf, new_key.clone()).unwrap();
    drop(path);
    fs.flush_interior_updates();

    // The node moved hash buckets; the old hash no longer resolves.
    assert!(fs.cache.lookup(new_hash).is_some());
    assert!(fs.cache.lookup(old_hash).is_none());
    assert_eq!(leaf.key(), new_key);

    // The parent's child entry carries the new pointer.
    let root_node = fs.roots.root_node(TEST_BTREE).unwrap();
    let parent_entry = root_node
        .state()
        .data
        .live_entries()
        .find(|e| e.key.pos == new_key.pos)
        .unwrap()
        .key
        .clone();
    assert_eq!(parent_entry, new_key);

    assert_eq!(interior::updates_nr_pending(&fs), 0);
    fs.unmount();
}

#[test]
fn roots_round_trip_is_idempotent() {
    let (fs, _device, cx) = mount_small();
    mkfs(&fs, &cx);

    let snapshot = fs.roots.merge_root_entries(Vec::new());
    assert!(!snapshot.is_empty());

    let registry = root::RootRegistry::new();
    registry.entries_to_roots(&snapshot);
    let round_tripped = registry.merge_root_entries(Vec::new());
    assert_eq!(snapshot, round_tripped);

    // Feeding the snapshot back once more changes nothing.
    registry.entries_to_roots(&round_tripped);
    assert_eq!(registry.merge_root_entries(Vec::new()), snapshot);
    fs.unmount();
}
