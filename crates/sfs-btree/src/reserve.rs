//! Node allocation for interior updates.
//!
//! `reserve_get` guarantees an update holds `nr` pre-allocated nodes,
//! each with a disk extent, a pointer key, open-bucket reservations, and
//! intent+write locks, before any topology change begins. A bounded
//! process-wide cache of (open buckets, pointer key) pairs smooths
//! bursts; allocation misses go to the sector allocator at a reserve
//! class chosen from the caller's flags. The cache cannibalize lock is
//! held across the whole fill so one update's burst cannot starve
//! another halfway.

use crate::fs::Fs;
use crate::interior::{
    flags, InteriorUpdate, BTREE_NODE_RESERVE, RESERVE_CACHE_CAP, RESERVE_MAX,
};
use crate::node::{Node, NodeData, SIB_U64S_NONE};
use asupersync::Cx;
use sfs_alloc::ReserveClass;
use sfs_error::Result;
use sfs_key::{BtreePtr, KeyEntry, KeyVal};
use sfs_types::{Level, SectorCount, POS_MIN};
use std::sync::Arc;
use tracing::trace;

fn reserve_class(fl: u32) -> (usize, ReserveClass) {
    if fl & flags::USE_ALLOC_RESERVE != 0 {
        (0, ReserveClass::Alloc)
    } else if fl & flags::USE_RESERVE != 0 {
        (BTREE_NODE_RESERVE / 2, ReserveClass::Btree)
    } else {
        (BTREE_NODE_RESERVE, ReserveClass::None)
    }
}

/// Allocate one raw node: disk extent + pointer key + open buckets,
/// descriptor locked intent+write. Identity (btree id, level, data) is
/// installed later when the update takes the node out of its prealloc.
fn node_alloc_raw(fs: &Fs, fl: u32, cx: &Cx) -> Result<Arc<Node>> {
    let (cache_floor, class) = reserve_class(fl);
    let nowait = fl & flags::NOWAIT != 0;

    let cached = {
        let mut inner = fs.interior.lock.lock();
        if inner.reserve_cache.len() > cache_floor {
            inner.reserve_cache.pop()
        } else {
            None
        }
    };

    let (obs, key) = match cached {
        Some(pair) => pair,
        None => {
            let node_sectors = fs.opts.btree_node_sectors;
            let mut wp = loop {
                let wp = fs.alloc.alloc_sectors_start(
                    cx,
                    fs.opts.metadata_replicas,
                    class,
                    nowait,
                )?;
                if wp.sectors_free >= node_sectors {
                    break wp;
                }
                // Short fill: retire the stub buckets or we would spin
                // on the same ones.
                let mut wp = wp;
                fs.alloc.writepoint_retire_short(&mut wp, node_sectors);
                fs.alloc.alloc_sectors_done(wp);
            };

            let ptrs = fs.alloc.alloc_sectors_append_ptrs(&mut wp, node_sectors);
            let val = if fs.opts.ptr_v2 {
                BtreePtr::V2 {
                    ptrs,
                    min_key: POS_MIN,
                    seq: sfs_types::NodeSeq(0),
                    sectors_written: SectorCount(0),
                    sectors: SectorCount(node_sectors),
                }
            } else {
                BtreePtr::V1 { ptrs }
            };
            let key = KeyEntry::ptr(POS_MIN, val);
            let obs = fs.alloc.open_buckets_get(&wp);
            fs.alloc.alloc_sectors_done(wp);
            (obs, key)
        }
    };

    // Placeholder identity; node_alloc installs the real one.
    let node = fs.cache.mem_alloc(sfs_types::BtreeId::Extents, Level(0));
    {
        let mut ns = node.state();
        ns.hash_val = key.as_btree_ptr().map_or(0, BtreePtr::hash_val);
        ns.key = key;
        ns.open_buckets = obs;
    }
    Ok(node)
}

/// Top up `update`'s prealloc pool to `nr` nodes.
pub fn reserve_get(
    fs: &Fs,
    update: &Arc<InteriorUpdate>,
    nr: usize,
    fl: u32,
    cx: &Cx,
) -> Result<()> {
    assert!(nr <= RESERVE_MAX, "update reserve too large");

    // Serialises reaping from the node cache and use of the btree open
    // bucket reserve.
    let guard = fs
        .cache
        .cannibalize_lock(cx, fl & flags::NOWAIT != 0)?;

    let fill = || -> Result<()> {
        while update.state().prealloc.len() < nr {
            let b = node_alloc_raw(fs, fl, cx)?;
            if let Err(err) = fs.replicas.mark_key_replicas(&b.key()) {
                let obs = std::mem::take(&mut b.state().open_buckets);
                fs.alloc.open_buckets_put(&obs);
                node_free_never_used(fs, &b);
                return Err(err);
            }
            update.state().prealloc.push(b);
        }
        Ok(())
    };
    let res = fill();
    drop(guard);
    if let Err(err) = &res {
        trace!(
            target: "sfs::btree::reserve",
            event = "reserve_get_failed",
            want = nr,
            error = %err
        );
    }
    res
}

/// Return whatever the update did not use: pointer keys and buckets go
/// back to the reserve cache (capacity permitting), descriptors to the
/// freeable pool.
pub fn reserve_put(fs: &Fs, update: &Arc<InteriorUpdate>) {
    loop {
        let Some(b) = update.state().prealloc.pop() else {
            break;
        };
        let (obs, key) = {
            let mut bs = b.state();
            (std::mem::take(&mut bs.open_buckets), bs.key.clone())
        };

        let overflow = {
            let mut inner = fs.interior.lock.lock();
            if inner.reserve_cache.len() < RESERVE_CACHE_CAP {
                inner.reserve_cache.push((obs, key));
                None
            } else {
                Some(obs)
            }
        };
        if let Some(obs) = overflow {
            fs.alloc.open_buckets_put(&obs);
        }

        node_free_never_used(fs, &b);
    }
}

/// Retire a descriptor that was never published: never hashed, never
/// dirtied. Open buckets must already be detached.
fn node_free_never_used(fs: &Fs, b: &Arc<Node>) {
    {
        let bs = b.state();
        assert!(!bs.flags.dirty, "freeing a dirty prealloc node");
        assert!(bs.open_buckets.is_empty(), "prealloc node still holds buckets");
        assert!(bs.write_blocked.is_empty());
        assert!(bs.will_make_reachable.is_none());
    }
    b.lock.unlock_write();
    b.lock.unlock_intent();
    fs.cache.freeable_push(Arc::clone(b));
}

/// Take a node out of the update's prealloc and give it an identity:
/// level, btree id, fresh data generation, dirty + need-write, hashed
/// into the cache. Returned still locked intent+write.
pub fn node_alloc(fs: &Fs, update: &Arc<InteriorUpdate>, level: Level) -> Arc<Node> {
    let b = update
        .state()
        .prealloc
        .pop()
        .expect("update reserve exhausted");

    {
        let mut bs = b.state();
        bs.btree_id = update.btree_id;
        bs.level = level;
        bs.flags.accessed = true;
        bs.flags.dirty = true;
        bs.flags.need_write = true;
        bs.flags.written = false;

        let seq = fs.next_node_seq();
        bs.data = NodeData::empty(seq);
        bs.nr = Default::default();
        bs.sib_u64s = [0; 2];

        if let KeyVal::Ptr(BtreePtr::V2 {
            seq: key_seq,
            sectors_written,
            ..
        }) = &mut bs.key.val
        {
            *key_seq = seq;
            *sectors_written = SectorCount(0);
        }
    }
    fs.cache.hash_insert(&b);
    trace!(
        target: "sfs::btree::reserve",
        event = "node_alloc",
        update = update.id.0,
        level = level.0
    );
    b
}

/// Build the replacement for `b`: same range, bumped data seq, format
/// chosen by the planner (fallback to `b`'s on overflow), keys sorted
/// in.
pub fn alloc_replacement(fs: &Fs, update: &Arc<InteriorUpdate>, b: &Arc<Node>) -> Arc<Node> {
    let n = node_alloc(fs, update, b.level());
    let bs = b.state();
    let mut ns = n.state();

    ns.data.seq = bs.data.seq.next();
    let new_seq = ns.data.seq;
    if let KeyVal::Ptr(BtreePtr::V2 { seq, .. }) = &mut ns.key.val {
        *seq = new_seq;
    }
    ns.set_min(bs.data.min_key);
    ns.set_max(bs.data.max_key);
    ns.data.format = crate::format::replacement_format(fs.opts.btree_node_sectors, &bs.data, &bs.nr);
    ns.data.sort_in(&bs.data);
    ns.nr = ns.data.compute_nr();

    let sib = u16::try_from(ns.nr.live_u64s).unwrap_or(SIB_U64S_NONE - 1);
    ns.sib_u64s = [sib, sib];
    drop(bs);
    drop(ns);
    n
}

/// Retire a node from the tree in memory. Caller holds intent; both
/// locks are released.
pub fn node_free_inmem(fs: &Fs, b: &Arc<Node>) {
    b.lock.lock_write();
    {
        let bs = b.state();
        assert!(!bs.flags.dirty, "freeing a dirty node");
        assert!(!bs.flags.need_write, "freeing a node with a pending write");
        assert!(bs.open_buckets.is_empty(), "freeing a node holding buckets");
        assert!(bs.write_blocked.is_empty(), "freeing a write-blocked node");
        assert!(
            bs.will_make_reachable.is_none(),
            "freeing a node pending reachability"
        );
    }
    fs.cache.hash_remove(b);
    fs.cache.freeable_push(Arc::clone(b));
    b.lock.unlock_write();
    b.lock.unlock_intent();
}
