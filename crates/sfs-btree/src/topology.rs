//! The four topology operations: split, merge, rewrite, and pointer
//! update, plus the interior insert path they all funnel through.
//!
//! All of them follow the same shape: will-free the nodes being
//! replaced, build replacements from the update's reserve, dispatch the
//! replacement writes, publish into the parent (or the root registry),
//! transfer open buckets to the update, splice the path, and free the
//! old nodes in memory. Nothing becomes reachable on disk until the
//! update's finalizer journals the parent mutation.

use crate::fs::Fs;
use crate::interior::{
    self, flags, update_reserve_required, update_start, InteriorUpdate,
};
use crate::node::{Node, Sibling, SIB_U64S_NONE};
use crate::path::{node_get, Path};
use crate::{format, io, reserve, root};
use asupersync::Cx;
use sfs_error::{Result, StoreError};
use sfs_journal::JournalEntry;
use sfs_key::{BtreePtr, FormatState, KeyEntry, KeyVal, Keylist};
use sfs_types::{Level, NodeSeq, POS_MAX, POS_MIN};
use std::sync::Arc;
use tracing::{debug, trace};

/// Insert one pointer key into `b`, journalling it as part of the
/// owning update's payload.
fn insert_fixup(update: &Arc<InteriorUpdate>, b: &Arc<Node>, key: KeyEntry) {
    let (btree_id, level) = {
        let s = b.state();
        (s.btree_id, s.level)
    };
    {
        let mut st = update.state();
        interior::push_journal_entry(
            &mut st,
            JournalEntry::BtreeKeys {
                btree_id,
                level,
                key: key.clone(),
            },
        );
    }
    let mut bs = b.state();
    bs.data.insert_key(key);
    bs.nr = bs.data.compute_nr();
    bs.flags.dirty = true;
    bs.flags.need_write = true;
}

/// Interior splits must be atomic with the insert that triggered them:
/// insert first, then pick the pivot. Whiteouts are compacted away so a
/// duplicate position can never become the pivot.
fn split_insert_keys(update: &Arc<InteriorUpdate>, b: &Arc<Node>, keys: &mut Keylist) {
    keys.verify_sorted();
    while let Some(k) = keys.pop_front() {
        insert_fixup(update, b, k);
    }
    let mut bs = b.state();
    bs.data.compact_whiteouts();
    bs.nr = bs.data.compute_nr();
    if !bs.level.is_leaf() {
        bs.interior_verify();
    }
}

/// Move the tail of `n1` into a fresh sibling. The pivot is the last
/// key before the 3/5 point of the bset.
fn split_node(fs: &Fs, update: &Arc<InteriorUpdate>, n1: &Arc<Node>) -> Arc<Node> {
    let n2 = reserve::node_alloc(fs, update, n1.level());
    interior::add_new_node(fs, update, &n2);

    let mut n1s = n1.state();
    let mut n2s = n2.state();

    n2s.data.format = n1s.data.format;
    n2s.data.seq = n1s.data.seq;
    let new_seq = n2s.data.seq;
    if let KeyVal::Ptr(BtreePtr::V2 { seq, .. }) = &mut n2s.key.val {
        *seq = new_seq;
    }

    let total = n1s.data.set_u64s();
    let threshold = total * 3 / 5;
    let mut offset = 0;
    let mut prev: Option<usize> = None;
    for i in 0..n1s.data.entries.len() {
        if i + 1 == n1s.data.entries.len() {
            break;
        }
        if offset >= threshold {
            break;
        }
        offset += n1s.data.entries[i].u64s(&n1s.data.format);
        prev = Some(i);
    }
    let pivot = prev.expect("splitting a node with fewer than two keys");
    let pivot_pos = n1s.data.entries[pivot].key.pos;
    let old_max = n1s.data.max_key;

    let tail: Vec<_> = n1s.data.entries.split_off(pivot + 1);
    n1s.set_max(pivot_pos);
    n2s.set_min(pivot_pos.successor());
    n2s.set_max(old_max);
    n2s.data.entries = tail;

    n1s.nr = n1s.data.compute_nr();
    n2s.nr = n2s.data.compute_nr();
    assert!(!n1s.data.entries.is_empty());
    assert!(!n2s.data.entries.is_empty());

    let sib1 = u16::try_from(n1s.nr.live_u64s).unwrap_or(SIB_U64S_NONE - 1);
    let sib2 = u16::try_from(n2s.nr.live_u64s).unwrap_or(SIB_U64S_NONE - 1);
    n1s.sib_u64s = [sib1, sib1];
    n2s.sib_u64s = [sib2, sib2];

    if !n1s.level.is_leaf() {
        n1s.interior_verify();
        n2s.interior_verify();
    }
    drop(n2s);
    drop(n1s);
    n2
}

/// A new root for a deepening tree: empty node at `level` spanning the
/// whole key space.
fn root_alloc_for_split(fs: &Fs, update: &Arc<InteriorUpdate>, level: Level) -> Arc<Node> {
    let b = reserve::node_alloc(fs, update, level);
    {
        let mut bs = b.state();
        bs.set_min(POS_MIN);
        bs.set_max(POS_MAX);
        bs.data.format = format::calc_format(&bs.data);
        bs.sib_u64s = [SIB_U64S_NONE; 2];
    }
    interior::add_new_node(fs, update, &b);
    b.lock.unlock_write();
    b
}

/// Split (or just compact) `b`. `keys`, if given, are inserted into the
/// replacement before the pivot is chosen. Publishes into the parent,
/// or grows the tree by one level when the root split.
pub fn btree_split(
    fs: &Fs,
    cx: &Cx,
    update: &Arc<InteriorUpdate>,
    b: &Arc<Node>,
    path: &mut Path,
    mut keys: Option<&mut Keylist>,
    fl: u32,
) {
    let parent = path.parent_of(b);
    if parent.is_none() {
        let root = fs.roots.root_node(b.btree_id()).expect("tree has a root");
        assert!(Arc::ptr_eq(&root, b), "splitting an unreachable node");
    }

    interior::will_free_node(fs, update, b);

    let n1 = reserve::alloc_replacement(fs, update, b);
    interior::add_new_node(fs, update, &n1);

    if let Some(keys) = keys.take() {
        split_insert_keys(update, &n1, keys);
    }

    let mut parent_keys = Keylist::new();
    let mut n2: Option<Arc<Node>> = None;
    let mut n3: Option<Arc<Node>> = None;

    if n1.state().data.set_u64s() > fs.opts.split_threshold() {
        debug!(
            target: "sfs::btree::topology",
            event = "split",
            level = b.level().0,
            max_key = %b.state().data.max_key
        );
        let nn2 = split_node(fs, update, &n1);
        n2 = Some(Arc::clone(&nn2));

        nn2.lock.unlock_write();
        n1.lock.unlock_write();

        io::node_write(fs, cx, &nn2);

        parent_keys.push(n1.key());
        parent_keys.push(nn2.key());

        if parent.is_none() {
            // Depth increases; make a new root.
            let nn3 = root_alloc_for_split(fs, update, b.level().parent());
            split_insert_keys(update, &nn3, &mut parent_keys);
            io::node_write(fs, cx, &nn3);
            n3 = Some(nn3);
        }
    } else {
        debug!(
            target: "sfs::btree::topology",
            event = "compact",
            level = b.level().0,
            max_key = %b.state().data.max_key
        );
        n1.lock.unlock_write();
        if parent.is_some() {
            parent_keys.push(n1.key());
        }
    }

    io::node_write(fs, cx, &n1);

    // New nodes all written (or queued); now make them visible.
    if let Some(p) = &parent {
        insert_node(fs, cx, update, p, path, &mut parent_keys, fl);
    } else if let Some(nn3) = &n3 {
        root::set_root(fs, update, nn3);
    } else {
        // Root filled up but didn't need to be split.
        root::set_root(fs, update, &n1);
    }

    interior::get_open_buckets(update, &n1);
    if let Some(nn2) = &n2 {
        interior::get_open_buckets(update, nn2);
    }
    if let Some(nn3) = &n3 {
        interior::get_open_buckets(update, nn3);
    }

    // Splice the path over to the replacements, then free the old node
    // in memory before anyone can relock it and see stale data.
    b.lock.increment_intent();
    path.node_drop(b);
    if let Some(nn3) = &n3 {
        path.node_replace(nn3);
    }
    if let Some(nn2) = &n2 {
        path.node_replace(nn2);
    }
    path.node_replace(&n1);
    reserve::node_free_inmem(fs, b);

    if let Some(nn3) = n3 {
        nn3.lock.unlock_intent();
    }
    if let Some(nn2) = n2 {
        nn2.lock.unlock_intent();
    }
    n1.lock.unlock_intent();
}

fn insert_fits(fs: &Fs, b: &Arc<Node>, u64s: usize) -> bool {
    b.state().data.set_u64s() + u64s <= fs.opts.btree_max_u64s()
}

fn insert_keys_interior(
    fs: &Fs,
    update: &Arc<InteriorUpdate>,
    b: &Arc<Node>,
    keys: &mut Keylist,
) {
    while let Some(k) = keys.pop_front() {
        insert_fixup(update, b, k);
    }
    interior::updated_node(fs, update, b);
}

/// Insert pointer keys into interior node `b`, splitting it if they do
/// not fit. The caller's path must hold intent locks to the root.
pub fn insert_node(
    fs: &Fs,
    cx: &Cx,
    update: &Arc<InteriorUpdate>,
    b: &Arc<Node>,
    path: &mut Path,
    keys: &mut Keylist,
    fl: u32,
) {
    assert!(!b.level().is_leaf(), "interior insert into a leaf");
    assert!(
        update.state().b.is_none(),
        "update already did its final insert"
    );
    keys.verify_sorted();

    let force_split =
        update.state().must_rewrite || b.state().flags.need_rewrite;
    if !force_split {
        b.lock.lock_write();
        if insert_fits(fs, b, keys.u64s()) {
            let old_live = b.state().nr.live_u64s;
            insert_keys_interior(fs, update, b, keys);

            {
                let mut bs = b.state();
                let live_added = isize::try_from(bs.nr.live_u64s).expect("fits")
                    - isize::try_from(old_live).expect("fits");
                if live_added < 0 {
                    for side in 0..2 {
                        if bs.sib_u64s[side] != SIB_U64S_NONE {
                            let adjusted =
                                isize::try_from(bs.sib_u64s[side]).expect("fits") + live_added;
                            bs.sib_u64s[side] =
                                u16::try_from(adjusted.max(0)).unwrap_or(SIB_U64S_NONE - 1);
                        }
                    }
                }
                // Dead keys accumulated by replaces; drop them while we
                // hold the write lock.
                if bs.data.entries.len() > bs.nr.packed_keys + bs.nr.unpacked_keys {
                    bs.data.compact_whiteouts();
                    bs.nr = bs.data.compute_nr();
                }
                if !bs.level.is_leaf() {
                    bs.interior_verify();
                }
            }
            b.lock.unlock_write();

            // New nodes aren't in the caller's path yet, so the merge
            // must not drop locks.
            foreground_maybe_merge(fs, cx, path, b.level(), fl | flags::NOUNLOCK);
            return;
        }
        b.lock.unlock_write();
    }

    btree_split(fs, cx, update, b, path, Some(keys), fl);
}

/// Split the leaf at the bottom of `path`. Entry point for the
/// leaf-insert path when a leaf fills up.
pub fn split_leaf(fs: &Fs, cx: &Cx, path: &mut Path, fl: u32) -> Result<()> {
    let b = path.node(Level(0)).expect("path reaches a leaf");

    // Splitting doesn't mix with gc.
    let _gc = if fl & flags::GC_LOCK_HELD == 0 {
        match fs.gc_lock.try_read() {
            Some(g) => Some(g),
            None => {
                if fl & flags::NOUNLOCK != 0 {
                    return Err(StoreError::Interrupted);
                }
                path.unlock();
                let g = fs.gc_lock.read();
                if !path.relock() {
                    return Err(StoreError::Interrupted);
                }
                Some(g)
            }
        }
    } else {
        None
    };

    if !path.upgrade() {
        return Err(StoreError::Interrupted);
    }

    let update = update_start(
        fs,
        path,
        path.btree_id(),
        update_reserve_required(fs, &b),
        fl,
        cx,
    )?;

    btree_split(fs, cx, &update, &b, path, None, fl);
    interior::update_done(fs, &update);
    Ok(())
}

// ── Merge ───────────────────────────────────────────────────────────────────

fn get_sibling(
    fs: &Fs,
    cx: &Cx,
    parent: &Arc<Node>,
    b: &Arc<Node>,
    sib: Sibling,
) -> Result<Option<Arc<Node>>> {
    let b_pos = b.state().key.pos;
    let sib_key = {
        let ps = parent.state();
        let live: Vec<&crate::node::Entry> = ps.data.live_entries().collect();
        let idx = live
            .iter()
            .position(|e| e.key.pos == b_pos)
            .expect("node not found in its parent");
        let sib_idx = match sib {
            Sibling::Prev => idx.checked_sub(1),
            Sibling::Next => (idx + 1 < live.len()).then_some(idx + 1),
        };
        sib_idx.map(|i| live[i].key.clone())
    };
    let Some(key) = sib_key else {
        return Ok(None);
    };
    let m = node_get(fs, cx, &key, b.level())?;
    m.lock.lock_intent();
    Ok(Some(m))
}

/// Try to merge the node at `level` with both siblings.
pub fn foreground_maybe_merge(fs: &Fs, cx: &Cx, path: &mut Path, level: Level, fl: u32) {
    maybe_merge_sibling(fs, cx, path, level, Sibling::Prev, fl);
    maybe_merge_sibling(fs, cx, path, level, Sibling::Next, fl);
}

/// Merge the node at `level` with its `sib` sibling if the pair packs
/// under the foreground threshold. Opportunistic: any contention or
/// resource shortage just skips the merge.
pub fn maybe_merge_sibling(fs: &Fs, cx: &Cx, path: &mut Path, level: Level, sib: Sibling, fl: u32) {
    let Some(b) = path.node(level) else { return };
    let Some(parent) = path.parent_of(&b) else {
        return;
    };

    if usize::from(b.state().sib_u64s[sib as usize]) > fs.opts.merge_threshold() {
        return;
    }

    let m = match get_sibling(fs, cx, &parent, &b, sib) {
        Ok(Some(m)) => m,
        Ok(None) => {
            // Edge of the tree; remember there is nothing there.
            b.state().sib_u64s[sib as usize] = SIB_U64S_NONE;
            return;
        }
        Err(err) => {
            trace!(
                target: "sfs::btree::topology",
                event = "merge_sibling_fetch_failed",
                error = %err
            );
            return;
        }
    };

    let (prev, next) = match sib {
        Sibling::Prev => (Arc::clone(&m), Arc::clone(&b)),
        Sibling::Next => (Arc::clone(&b), Arc::clone(&m)),
    };

    // Joint format across both nodes.
    let joint = {
        let ps = prev.state();
        let ns = next.state();
        let mut s = FormatState::new();
        s.add_pos(ps.data.min_key);
        for e in ps.data.live_entries() {
            s.add_pos(e.key.pos);
        }
        for e in ns.data.live_entries() {
            s.add_pos(e.key.pos);
        }
        s.done()
    };

    let mut sib_u64s = {
        let bs = b.state();
        let ms = m.state();
        format::u64s_with_format(&bs.nr, &bs.data.format, &joint)
            + format::u64s_with_format(&ms.nr, &ms.data.format, &joint)
    };
    // Damp the estimate so repeated merges don't oscillate around the
    // threshold.
    let hysteresis = fs.opts.merge_hysteresis();
    if sib_u64s > hysteresis {
        sib_u64s = (sib_u64s - hysteresis) / 2 + hysteresis;
    }
    sib_u64s = sib_u64s.min(fs.opts.btree_max_u64s());
    b.state().sib_u64s[sib as usize] = u16::try_from(sib_u64s).unwrap_or(SIB_U64S_NONE - 1);

    if sib_u64s > fs.opts.merge_threshold() {
        m.lock.unlock_intent();
        return;
    }

    let _gc = if fl & flags::GC_LOCK_HELD == 0 {
        match fs.gc_lock.try_read() {
            Some(g) => Some(g),
            None => {
                m.lock.unlock_intent();
                return;
            }
        }
    } else {
        None
    };

    if !path.upgrade() {
        m.lock.unlock_intent();
        return;
    }

    let update = match update_start(
        fs,
        path,
        path.btree_id(),
        update_reserve_required(fs, &parent) + 1,
        fl | flags::NOFAIL | flags::USE_RESERVE | flags::NOUNLOCK,
        cx,
    ) {
        Ok(u) => u,
        Err(err) => {
            trace!(
                target: "sfs::btree::topology",
                event = "merge_skipped",
                error = %err
            );
            m.lock.unlock_intent();
            return;
        }
    };

    debug!(
        target: "sfs::btree::topology",
        event = "merge",
        level = level.0,
        prev_max = %prev.state().data.max_key,
        next_max = %next.state().data.max_key
    );

    interior::will_free_node(fs, &update, &b);
    interior::will_free_node(fs, &update, &m);

    let n = reserve::node_alloc(fs, &update, level);
    interior::add_new_node(fs, &update, &n);
    {
        let ps = prev.state();
        let ns_src = next.state();
        let mut ns = n.state();
        ns.data.seq = NodeSeq(ps.data.seq.0.max(ns_src.data.seq.0)).next();
        let new_seq = ns.data.seq;
        if let KeyVal::Ptr(BtreePtr::V2 { seq, .. }) = &mut ns.key.val {
            *seq = new_seq;
        }
        ns.set_min(ps.data.min_key);
        ns.set_max(ns_src.data.max_key);
        ns.data.format = joint;
        ns.data.sort_in(&ps.data);
        ns.data.sort_in(&ns_src.data);
        ns.nr = ns.data.compute_nr();
        let live = u16::try_from(ns.nr.live_u64s).unwrap_or(SIB_U64S_NONE - 1);
        ns.sib_u64s = [live, live];
    }
    n.lock.unlock_write();

    // The parent delta: the new node's pointer replaces next's entry
    // (same max key), and prev's covering pointer is deleted.
    let mut keys = Keylist::new();
    keys.push(KeyEntry::whiteout(prev.state().key.pos));
    keys.push(n.key());

    io::node_write(fs, cx, &n);

    insert_node(fs, cx, &update, &parent, path, &mut keys, fl);

    interior::get_open_buckets(&update, &n);

    b.lock.increment_intent();
    path.node_drop(&b);
    path.node_replace(&n);

    reserve::node_free_inmem(fs, &b);
    reserve::node_free_inmem(fs, &m);

    n.lock.unlock_intent();
    interior::update_done(fs, &update);
}

// ── Rewrite ─────────────────────────────────────────────────────────────────

fn rewrite_node_fallible(
    fs: &Fs,
    cx: &Cx,
    path: &mut Path,
    b: &Arc<Node>,
    fl: u32,
) -> Result<()> {
    let parent = path.parent_of(b);
    let nr_nodes = parent
        .as_ref()
        .map_or(0, |p| update_reserve_required(fs, p))
        + 1;

    let update = update_start(fs, path, b.btree_id(), nr_nodes, fl, cx)?;

    interior::will_free_node(fs, &update, b);

    let n = reserve::alloc_replacement(fs, &update, b);
    interior::add_new_node(fs, &update, &n);
    n.lock.unlock_write();

    debug!(
        target: "sfs::btree::topology",
        event = "rewrite",
        level = b.level().0,
        max_key = %b.state().data.max_key
    );

    io::node_write(fs, cx, &n);

    if let Some(p) = &parent {
        let mut keys = Keylist::new();
        keys.push(n.key());
        insert_node(fs, cx, &update, p, path, &mut keys, fl);
    } else {
        root::set_root(fs, &update, &n);
    }

    interior::get_open_buckets(&update, &n);

    b.lock.increment_intent();
    path.node_drop(b);
    path.node_replace(&n);
    reserve::node_free_inmem(fs, b);
    n.lock.unlock_intent();

    interior::update_done(fs, &update);
    Ok(())
}

/// Rewrite/move the node at `level`, keyed by its data seq: if the node
/// was already rewritten by someone else, succeed without doing
/// anything. Used by GC to defragment and to retire old formats.
pub fn node_rewrite(
    fs: &Fs,
    cx: &Cx,
    path: &mut Path,
    level: Level,
    seq: NodeSeq,
    fl: u32,
) -> Result<()> {
    let fl = fl | flags::NOFAIL;
    let _gc = if fl & flags::GC_LOCK_HELD == 0 {
        Some(fs.gc_lock.read())
    } else {
        None
    };

    let mut attempts = 0;
    loop {
        if !path.upgrade() {
            return Err(StoreError::Interrupted);
        }
        let Some(b) = path.node(level) else {
            return Ok(());
        };
        if b.data_seq() != seq {
            // Raced with another rewrite; nothing left to do.
            return Ok(());
        }

        match rewrite_node_fallible(fs, cx, path, &b, fl) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() && attempts < 3 => {
                attempts += 1;
                if !path.relock() {
                    return Err(StoreError::Interrupted);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

// ── Pointer update ──────────────────────────────────────────────────────────

/// Atomically replace `b`'s pointer key (same position, new replica
/// set). While the parent insert is pending, a temporary descriptor is
/// installed under the new hash so lookups find the node by either key;
/// the real swap happens after the insert. A root's registry entry is
/// updated in place and a root journal entry queued.
pub fn node_update_key(
    fs: &Fs,
    cx: &Cx,
    path: &mut Path,
    b: &Arc<Node>,
    new_key: KeyEntry,
) -> Result<()> {
    assert!(
        new_key.pos == b.state().key.pos,
        "update_key must not move the node"
    );
    let new_hash = new_key
        .as_btree_ptr()
        .expect("pointer key required")
        .hash_val();

    if !path.upgrade() {
        return Err(StoreError::Interrupted);
    }
    let _gc = fs.gc_lock.read();

    let parent = path.parent_of(b);
    let hash_changed = new_hash != b.hash_val();

    // A temporary descriptor under the new hash keeps concurrent
    // lookups working during the window where the parent insert is in
    // flight but b still hashes under the old key.
    let tmp = if hash_changed && parent.is_some() {
        let _cl = fs.cache.cannibalize_lock(cx, false)?;
        let tmp = fs.cache.mem_alloc(b.btree_id(), b.level());
        Some(tmp)
    } else {
        None
    };

    let release_tmp = |tmp: Option<Arc<Node>>| {
        if let Some(tmp) = tmp {
            tmp.lock.unlock_write();
            tmp.lock.unlock_intent();
            fs.cache.freeable_push(tmp);
        }
    };

    let nr_nodes = parent
        .as_ref()
        .map_or(0, |p| update_reserve_required(fs, p));
    let update = match update_start(
        fs,
        path,
        b.btree_id(),
        nr_nodes,
        flags::NOFAIL | flags::USE_RESERVE | flags::USE_ALLOC_RESERVE,
        cx,
    ) {
        Ok(u) => u,
        Err(err) => {
            release_tmp(tmp);
            return Err(err);
        }
    };

    if let Err(err) = fs.replicas.mark_key_replicas(&new_key) {
        interior::update_free(fs, &update);
        release_tmp(tmp);
        return Err(err);
    }

    {
        let mut st = update.state();
        interior::will_delete_key(&mut st, b.key());
        interior::will_add_key(&mut st, new_key.clone());
    }

    if let Some(p) = &parent {
        if let Some(tmp) = &tmp {
            let mut ts = tmp.state();
            ts.key = new_key.clone();
            ts.hash_val = new_hash;
            drop(ts);
            fs.cache.hash_insert(tmp);
        }

        let mut keys = Keylist::new();
        keys.push(new_key.clone());
        insert_node(fs, cx, &update, p, path, &mut keys, 0);

        if let Some(tmp) = &tmp {
            fs.cache.hash_remove(tmp);
            fs.cache.hash_remove(b);
            {
                let mut bs = b.state();
                bs.key = new_key;
                bs.hash_val = new_hash;
            }
            fs.cache.hash_insert(b);
        } else {
            b.state().key = new_key;
        }
    } else {
        b.lock.lock_write();
        if hash_changed {
            fs.cache.hash_remove(b);
        }
        {
            let mut bs = b.state();
            bs.key = new_key;
            bs.hash_val = new_hash;
        }
        if hash_changed {
            fs.cache.hash_insert(b);
        }
        root::refresh_root_key(fs, b);
        interior::updated_root(fs, &update, b);
        b.lock.unlock_write();
    }

    release_tmp(tmp);

    interior::update_done(fs, &update);
    Ok(())
}

/// GC hook: force the next insert into this node down the split path,
/// scheduling a rewrite without a separate request.
pub fn set_need_rewrite(b: &Arc<Node>) {
    b.state().flags.need_rewrite = true;
}

/// Force this update's final insert down the split path regardless of
/// fit (coalescing and GC use this to rewrite the target as they go).
pub fn set_update_must_rewrite(update: &Arc<InteriorUpdate>) {
    update.state().must_rewrite = true;
}

/// Whether this update was forced into rewrite mode.
#[must_use]
pub fn update_must_rewrite(update: &Arc<InteriorUpdate>) -> bool {
    update.state().must_rewrite
}
