//! The asynchronous interior-update machinery.
//!
//! One `InteriorUpdate` tracks one topology change: the nodes it
//! reserved, its journal pre-reservation and pin, its disk reservation,
//! the nodes it will publish, and the parent (or root) mutation it will
//! finally journal. New nodes carry `will_make_reachable` back-refs and
//! a reference on the update's completion barrier; when the last child
//! write finishes, the finalizer worker journals the parent mutation,
//! unblocks the parent's write, and releases every resource.
//!
//! Locking: the global `InteriorState` mutex serialises membership of
//! per-node `write_blocked` queues, `will_make_reachable` back-refs, and
//! `new_nodes` lists, so reparenting is atomic with membership. Any
//! section taking both an update's state and a node's state must hold
//! the global mutex first.

use crate::fs::Fs;
use crate::node::{Node, WillMakeReachable};
use crate::path::Path;
use crate::{io, reserve};
use asupersync::Cx;
use parking_lot::{Condvar, Mutex, MutexGuard};
use sfs_alloc::replicas::Trigger;
use sfs_alloc::{DiskReservation, OpenBucketId};
use sfs_error::{Result, StoreError};
use sfs_journal::{
    JournalEntry, JournalPin, JournalPreres, JOURNAL_RES_NONBLOCK, JOURNAL_RES_RECLAIM,
};
use sfs_key::{KeyEntry, Keylist};
use sfs_types::{BtreeId, JournalSeq, UpdateId, MAX_DEPTH};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Caller flags for `update_start` and the topology entry points.
pub mod flags {
    /// Reservations must not fail; overdraw instead.
    pub const NOFAIL: u32 = 1 << 0;
    /// Allocate from the btree reserve.
    pub const USE_RESERVE: u32 = 1 << 1;
    /// Allocate from the allocator's own reserve (deepest tier).
    pub const USE_ALLOC_RESERVE: u32 = 1 << 2;
    /// The caller cannot drop its locks: any blocking acquisition
    /// becomes `Interrupted`.
    pub const NOUNLOCK: u32 = 1 << 3;
    /// Convert allocator waits into `WouldBlock`.
    pub const NOWAIT: u32 = 1 << 4;
    /// Journal reservation may draw on the reclaim pool.
    pub const JOURNAL_RESERVED: u32 = 1 << 5;
    /// Running on behalf of journal reclaim; never wait on reclaim.
    pub const JOURNAL_RECLAIM: u32 = 1 << 6;
    /// The caller already holds the GC lock.
    pub const GC_LOCK_HELD: u32 = 1 << 7;
}

/// Max nodes one update may reserve: a split at every level plus a new
/// root.
pub const RESERVE_MAX: usize = MAX_DEPTH as usize * 2 + 1;

/// Floor of pre-allocated nodes kept in the reserve cache for
/// `USE_RESERVE` callers.
pub const BTREE_NODE_RESERVE: usize = 8;

/// Reserve cache capacity.
pub const RESERVE_CACHE_CAP: usize = 16;

/// Worst-case u64s for one journalled pointer key (entry header + full
/// key + v2 metadata + replicas).
const JOURNAL_KEY_U64S_MAX: usize = 1 + 3 + 4 + 4;

/// Journal entry budget per update: two keys per level plus root
/// entries.
pub const JOURNAL_ENTRIES_CAP_U64S: usize = JOURNAL_KEY_U64S_MAX * (MAX_DEPTH as usize * 2 + 2);

/// Journal pre-reservation per update.
pub const UPDATE_JOURNAL_PRERES_U64S: u64 = JOURNAL_ENTRIES_CAP_U64S as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Freshly started; holds resources but targets nothing yet.
    None,
    /// Will insert into parent `b`, whose write it blocks.
    Node,
    /// Will journal a new root.
    Root,
    /// Its target node was freed; it survives only to carry its journal
    /// pin until the update that freed the node commits.
    Reparented,
}

pub struct UpdateState {
    pub mode: UpdateMode,
    pub flags: u32,
    /// The parent this update will mutate (`UpdateMode::Node` only).
    pub b: Option<Arc<Node>>,
    pub disk_res: DiskReservation,
    pub journal_preres: JournalPreres,
    pub journal_pin: JournalPin,
    pub prealloc: Vec<Arc<Node>>,
    pub new_nodes: Vec<Arc<Node>>,
    pub open_buckets: Vec<OpenBucketId>,
    /// Pointer deltas for allocator accounting at commit.
    pub old_keys: Keylist,
    pub new_keys: Keylist,
    /// The journal payload: parent insertions or the new root.
    pub journal_entries: Vec<JournalEntry>,
    pub journal_u64s: usize,
    pub nodes_written: bool,
    /// Forces the next insert through the split path (GC rewrite hook).
    pub must_rewrite: bool,
}

pub struct InteriorUpdate {
    pub id: UpdateId,
    pub btree_id: BtreeId,
    /// Completion barrier: one reference per unwritten new node, plus
    /// the update's own reference dropped at `update_done`. The final
    /// drop queues the finalizer.
    refs: AtomicU32,
    state: Mutex<UpdateState>,
}

impl InteriorUpdate {
    pub fn state(&self) -> MutexGuard<'_, UpdateState> {
        self.state.lock()
    }

    #[must_use]
    pub fn mode(&self) -> UpdateMode {
        self.state.lock().mode
    }

    #[must_use]
    pub fn journal_pin_seq(&self) -> Option<JournalSeq> {
        self.state.lock().journal_pin.seq()
    }
}

pub enum WorkerMsg {
    Run(UpdateId),
    Shutdown,
}

#[derive(Default)]
pub struct InteriorInner {
    pub updates: HashMap<u64, Arc<InteriorUpdate>>,
    /// Start order, for diagnostics.
    pub list: Vec<u64>,
    /// Updates with queued-but-unwritten journal payloads.
    pub unwritten: Vec<u64>,
    /// Pre-allocated (open buckets, pointer key) pairs.
    pub reserve_cache: Vec<(Vec<OpenBucketId>, KeyEntry)>,
    next_id: u64,
}

pub struct InteriorState {
    pub lock: Mutex<InteriorInner>,
    quiesce: Condvar,
    pub worker_tx: crossbeam_channel::Sender<WorkerMsg>,
}

impl InteriorState {
    #[must_use]
    pub fn new(worker_tx: crossbeam_channel::Sender<WorkerMsg>) -> InteriorState {
        InteriorState {
            lock: Mutex::new(InteriorInner::default()),
            quiesce: Condvar::new(),
            worker_tx,
        }
    }

    pub fn wait_quiescent(&self) {
        let mut inner = self.lock.lock();
        while !inner.list.is_empty() {
            self.quiesce.wait(&mut inner);
        }
    }

    pub(crate) fn notify(&self) {
        self.quiesce.notify_all();
    }
}

/// Nodes an update needs to split from `b`'s level to the root.
#[must_use]
pub fn update_reserve_required(fs: &Fs, b: &Arc<Node>) -> usize {
    let root_level = fs
        .roots
        .root_node(b.btree_id())
        .map_or(b.level(), |r| r.level());
    let depth = usize::from(root_level.0) + 1;
    ((depth - usize::from(b.level().0)) * 2 + 1).min(RESERVE_MAX)
}

pub(crate) fn push_journal_entry(st: &mut UpdateState, entry: JournalEntry) {
    assert!(
        st.journal_u64s + entry.u64s() <= JOURNAL_ENTRIES_CAP_U64S,
        "update journal entries overflow reservation"
    );
    st.journal_u64s += entry.u64s();
    st.journal_entries.push(entry);
}

/// Queue a pointer-delete for commit-time accounting.
pub fn will_delete_key(st: &mut UpdateState, key: KeyEntry) {
    st.old_keys.push(key);
}

/// Queue a new pointer for commit-time accounting.
pub fn will_add_key(st: &mut UpdateState, key: KeyEntry) {
    st.new_keys.push(key);
}

// ── Lifecycle ───────────────────────────────────────────────────────────────

/// Start a topology change: check journal health, then acquire — in
/// order — the journal pre-reservation, the disk reservation, and the
/// node reserve. Any failure unwinds everything acquired so far.
pub fn update_start(
    fs: &Fs,
    path: &mut Path,
    btree_id: BtreeId,
    nr_nodes: usize,
    fl: u32,
    cx: &Cx,
) -> Result<Arc<InteriorUpdate>> {
    if fs.journal.error() {
        return Err(StoreError::JournalError);
    }

    let update = {
        let mut inner = fs.interior.lock.lock();
        inner.next_id += 1;
        let id = UpdateId(inner.next_id);
        let update = Arc::new(InteriorUpdate {
            id,
            btree_id,
            refs: AtomicU32::new(1),
            state: Mutex::new(UpdateState {
                mode: UpdateMode::None,
                flags: fl,
                b: None,
                disk_res: DiskReservation::default(),
                journal_preres: JournalPreres::default(),
                journal_pin: JournalPin::default(),
                prealloc: Vec::new(),
                new_nodes: Vec::new(),
                open_buckets: Vec::new(),
                old_keys: Keylist::new(),
                new_keys: Keylist::new(),
                journal_entries: Vec::new(),
                journal_u64s: 0,
                nodes_written: false,
                must_rewrite: false,
            }),
        });
        inner.updates.insert(id.0, Arc::clone(&update));
        inner.list.push(id.0);
        update
    };

    let res = update_start_resources(fs, path, &update, nr_nodes, fl, cx);
    if let Err(err) = res {
        debug!(
            target: "sfs::btree::interior",
            event = "update_start_failed",
            update = update.id.0,
            error = %err
        );
        update_free(fs, &update);
        return Err(err);
    }

    trace!(
        target: "sfs::btree::interior",
        event = "update_start",
        update = update.id.0,
        btree = %btree_id,
        nr_nodes = nr_nodes
    );
    Ok(update)
}

fn update_start_resources(
    fs: &Fs,
    path: &mut Path,
    update: &Arc<InteriorUpdate>,
    nr_nodes: usize,
    fl: u32,
    cx: &Cx,
) -> Result<()> {
    let journal_flags = if fl & (flags::JOURNAL_RESERVED | flags::JOURNAL_RECLAIM) != 0 {
        JOURNAL_RES_RECLAIM
    } else {
        0
    };

    // Nonblocking first; only drop the caller's locks if it opted in.
    {
        let mut st = update.state();
        match fs.journal.preres_get(
            cx,
            &mut st.journal_preres,
            UPDATE_JOURNAL_PRERES_U64S,
            journal_flags | JOURNAL_RES_NONBLOCK,
        ) {
            Ok(()) => {}
            Err(StoreError::WouldBlock) => {
                if fl & flags::NOUNLOCK != 0 {
                    return Err(StoreError::Interrupted);
                }
                drop(st);
                path.unlock();
                let mut st = update.state();
                fs.journal.preres_get(
                    cx,
                    &mut st.journal_preres,
                    UPDATE_JOURNAL_PRERES_U64S,
                    journal_flags,
                )?;
                drop(st);
                if !path.relock() {
                    return Err(StoreError::Interrupted);
                }
            }
            Err(err) => return Err(err),
        }
    }

    let sectors = u64::from(fs.opts.btree_node_sectors) * nr_nodes as u64;
    let disk_res = fs.alloc.disk_reservation_get(
        sectors,
        fs.opts.metadata_replicas,
        fl & flags::NOFAIL != 0,
    )?;
    update.state().disk_res = disk_res;

    reserve::reserve_get(fs, update, nr_nodes, fl, cx)
}

/// The update has built and dispatched everything it is going to;
/// return the unused node reserve and drop the update's own barrier
/// reference. The finalizer runs once the last child write completes.
pub fn update_done(fs: &Fs, update: &Arc<InteriorUpdate>) {
    assert!(
        update.mode() != UpdateMode::None,
        "update_done on an update that targets nothing"
    );
    reserve::reserve_put(fs, update);
    update_barrier_put(fs, update.id);
}

/// Release every resource and unregister. Called by the finalizer, and
/// by `update_start` on failure.
pub(crate) fn update_free(fs: &Fs, update: &Arc<InteriorUpdate>) {
    {
        let mut st = update.state();
        fs.journal.preres_put(&mut st.journal_preres);
        fs.journal.pin_drop(&mut st.journal_pin);
        fs.alloc.disk_reservation_put(&mut st.disk_res);
    }
    reserve::reserve_put(fs, update);

    {
        let mut inner = fs.interior.lock.lock();
        inner.updates.remove(&update.id.0);
        inner.list.retain(|&id| id != update.id.0);
        inner.unwritten.retain(|&id| id != update.id.0);
    }
    fs.interior.notify();
}

// ── Barrier ─────────────────────────────────────────────────────────────────

pub(crate) fn update_barrier_get(update: &InteriorUpdate) {
    let prev = update.refs.fetch_add(1, Ordering::SeqCst);
    assert!(prev > 0, "barrier revived from zero");
}

/// Drop one barrier reference; the final drop marks the update written
/// and hands it to the finalizer worker.
pub(crate) fn update_barrier_put(fs: &Fs, id: UpdateId) {
    let update = {
        let inner = fs.interior.lock.lock();
        inner.updates.get(&id.0).cloned()
    };
    let update = update.expect("barrier put on freed update");
    if update.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
        update.state().nodes_written = true;
        trace!(
            target: "sfs::btree::interior",
            event = "nodes_written",
            update = id.0
        );
        let _ = fs.interior.worker_tx.send(WorkerMsg::Run(id));
    }
}

// ── State transitions ───────────────────────────────────────────────────────

/// `NoUpdate -> UpdatingNode`: the pointers this update inserted into
/// `b` reference children that are not durable yet, so `b`'s write is
/// blocked until this update completes.
pub fn updated_node(fs: &Fs, update: &Arc<InteriorUpdate>, b: &Arc<Node>) {
    let mut inner = fs.interior.lock.lock();
    {
        let mut st = update.state();
        let mut bs = b.state();

        assert!(st.mode == UpdateMode::None, "update already targeting");
        assert!(bs.flags.dirty, "write-blocking a clean node");

        st.mode = UpdateMode::Node;
        st.b = Some(Arc::clone(b));
        bs.write_blocked.push(update.id);
    }
    inner.unwritten.push(update.id.0);
}

/// `NoUpdate -> UpdatingRoot`: queue a root entry; the finalizer's
/// journal commit is what makes the new root real.
pub fn updated_root(fs: &Fs, update: &Arc<InteriorUpdate>, b: &Arc<Node>) {
    let mut inner = fs.interior.lock.lock();
    {
        let mut st = update.state();
        let bs = b.state();

        assert!(st.mode == UpdateMode::None, "update already targeting");
        let entry = JournalEntry::BtreeRoot {
            btree_id: bs.btree_id,
            level: bs.level,
            key: bs.key.clone(),
        };
        drop(bs);
        push_journal_entry(&mut st, entry);
        st.mode = UpdateMode::Root;
    }
    inner.unwritten.push(update.id.0);
}

/// Transfer `child`'s dependency onto `parent`: `child`'s target node
/// is going away, so its journal pin rides on the update that will
/// actually commit. Caller holds the interior lock.
fn reparent(fs: &Fs, parent_st: &mut UpdateState, child: &Arc<InteriorUpdate>) {
    let mut cst = child.state();
    cst.b = None;
    cst.mode = UpdateMode::Reparented;
    fs.journal.pin_copy(&mut parent_st.journal_pin, &cst.journal_pin);
    fs.journal.pin_drop(&mut cst.journal_pin);
}

/// Track `b` as a node this update will publish. Blocks the finalizer
/// on `b`'s write, and suppresses any write of `b` past the first until
/// `b` is reachable.
pub fn add_new_node(fs: &Fs, update: &Arc<InteriorUpdate>, b: &Arc<Node>) {
    update_barrier_get(update);

    let _inner = fs.interior.lock.lock();
    let mut st = update.state();
    let mut bs = b.state();

    assert!(
        bs.will_make_reachable.is_none(),
        "node already owned by another update"
    );
    st.new_nodes.push(Arc::clone(b));
    bs.will_make_reachable = Some(WillMakeReachable {
        update: update.id,
        ref_held: true,
    });

    let key = bs.key.clone();
    drop(bs);
    will_add_key(&mut st, key);
}

/// Detach `b` from the update that was going to make it reachable
/// (because `b` itself is now being freed before that ever happened).
pub(crate) fn drop_new_node(fs: &Fs, b: &Arc<Node>) {
    let put = {
        let inner = fs.interior.lock.lock();
        let mut bs = b.state();
        let Some(wmr) = bs.will_make_reachable.take() else {
            return;
        };
        let owner = inner
            .updates
            .get(&wmr.update.0)
            .cloned()
            .expect("will_make_reachable names a live update");
        let mut ost = owner.state();
        let idx = ost
            .new_nodes
            .iter()
            .position(|n| Arc::ptr_eq(n, b))
            .expect("new node tracked by its update");
        ost.new_nodes.remove(idx);
        wmr.ref_held.then_some(wmr.update)
    };
    if let Some(id) = put {
        update_barrier_put(fs, id);
    }
}

/// Move `b`'s allocator reservations onto the update, so the space is
/// pinned until the update commits.
pub fn get_open_buckets(update: &Arc<InteriorUpdate>, b: &Arc<Node>) {
    let mut st = update.state();
    let mut bs = b.state();
    let mut obs = std::mem::take(&mut bs.open_buckets);
    st.open_buckets.append(&mut obs);
}

/// `b` is being split/rewritten/merged away. Reparent every update
/// blocked on `b`, take over `b`'s journal pins, cancel its pending
/// write, and queue the deletion of its pointer.
pub fn will_free_node(fs: &Fs, update: &Arc<InteriorUpdate>, b: &Arc<Node>) {
    {
        let mut bs = b.state();
        bs.flags.dying = true;
        if bs.flags.fake {
            return;
        }
    }

    {
        let inner = fs.interior.lock.lock();
        let mut st = update.state();
        let mut bs = b.state();

        for id in std::mem::take(&mut bs.write_blocked) {
            let child = inner
                .updates
                .get(&id.0)
                .cloned()
                .expect("write-blocked update is live");
            debug!(
                target: "sfs::btree::interior",
                event = "reparent",
                child = id.0,
                onto = update.id.0
            );
            reparent(fs, &mut st, &child);
        }

        bs.flags.dirty = false;
        bs.flags.need_write = false;

        // Unwritten data in b pinned the journal; those entries must
        // now outlive *this* update instead. Both write slots can hold
        // pins (current and previous write).
        let pin = bs.writes.current_mut();
        fs.journal.pin_copy(&mut st.journal_pin, pin);
        fs.journal.pin_drop(pin);
        let pin = bs.writes.prev_mut();
        fs.journal.pin_copy(&mut st.journal_pin, pin);
        fs.journal.pin_drop(pin);

        let key = bs.key.clone();
        drop(bs);
        will_delete_key(&mut st, key);
    }
    fs.interior.notify();

    drop_new_node(fs, b);
}

// ── Finalizer ───────────────────────────────────────────────────────────────

pub(crate) fn worker_loop(fs: &Arc<Fs>, rx: &crossbeam_channel::Receiver<WorkerMsg>) {
    let cx = Cx::for_request();
    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Run(id) => nodes_written(fs, &cx, id),
            WorkerMsg::Shutdown => break,
        }
    }
}

/// The transactional tail of an update, run once all its new nodes are
/// durable: journal the parent insertion (or new root) together with a
/// complete root snapshot, mark pointer deltas, advance the parent's
/// bset journal-seq floor, unblock and schedule the parent write, then
/// shed every resource.
pub(crate) fn nodes_written(fs: &Fs, cx: &Cx, id: UpdateId) {
    let update = {
        let inner = fs.interior.lock.lock();
        inner.updates.get(&id.0).cloned()
    };
    let Some(update) = update else {
        return;
    };
    assert!(update.state().nodes_written, "finalizer ran early");

    // The inner transaction must not wait on journal reclaim: reclaim
    // itself does interior updates, and we hold open buckets it may
    // need. Space was pre-reserved at start; the commit draws on that.
    let trans_res = nodes_written_trans(fs, &update);
    if let Err(err) = &trans_res {
        assert!(
            fs.journal.error(),
            "interior update commit failed without journal error: {err}"
        );
        warn!(
            target: "sfs::btree::interior",
            event = "finalize_skipped_journal_error",
            update = id.0
        );
    }

    let b = update.state().b.clone();
    if let Some(b) = b {
        // On journal error we still unblock the write so shutdown can
        // proceed; the write path itself refuses the physical write.
        b.lock.lock_intent();
        b.lock.lock_write();
        {
            let _inner = fs.interior.lock.lock();
            let st = update.state();
            let mut bs = b.state();
            bs.write_blocked.retain(|&uid| uid != id);

            let still_ours = st.b.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, &b));
            if let (Ok(seq), true) = (&trans_res, still_ours) {
                assert!(!bs.level.is_leaf(), "interior update targeting a leaf");
                assert!(bs.flags.dirty, "blocked parent lost its dirty bit");
                // Monotonic lower bound for recovery ordering.
                bs.data.journal_seq = bs.data.journal_seq.max(*seq);
                let pin = bs.writes.current_mut();
                fs.journal.pin_add(pin, *seq);
            }
        }
        b.lock.unlock_write();
        io::node_write(fs, cx, &b);
        b.lock.unlock_intent();
    }

    {
        let mut st = update.state();
        fs.journal.pin_drop(&mut st.journal_pin);
        fs.journal.preres_put(&mut st.journal_preres);
    }

    // The new nodes are reachable now; clear the back-refs.
    let new_nodes = {
        let _inner = fs.interior.lock.lock();
        let st = update.state();
        for n in &st.new_nodes {
            let mut ns = n.state();
            let wmr = ns
                .will_make_reachable
                .take()
                .expect("new node lost its back-ref");
            assert!(wmr.update == id, "new node owned by a different update");
            assert!(!wmr.ref_held, "finalizer ran before node write completed");
        }
        st.new_nodes.clone()
    };
    // A second modification may have re-dirtied them while unreachable.
    for n in &new_nodes {
        n.lock.lock_read();
        io::node_write(fs, cx, n);
        n.lock.unlock_read();
    }

    let obs = std::mem::take(&mut update.state().open_buckets);
    fs.alloc.open_buckets_put(&obs);

    debug!(
        target: "sfs::btree::interior",
        event = "update_complete",
        update = id.0,
        mode = ?update.mode()
    );
    update_free(fs, &update);
}

fn nodes_written_trans(fs: &Fs, update: &Arc<InteriorUpdate>) -> Result<JournalSeq> {
    let (entries, new_keys, old_keys) = {
        let st = update.state();
        (
            st.journal_entries.clone(),
            st.new_keys.clone(),
            st.old_keys.clone(),
        )
    };

    let full = fs.roots.merge_root_entries(entries);
    let seq = fs.journal.commit(full)?;

    let sectors = fs.opts.btree_node_sectors;
    for k in &new_keys {
        fs.replicas.trans_mark_key(k, sectors, Trigger::Insert)?;
    }
    for k in &old_keys {
        fs.replicas.trans_mark_key(k, sectors, Trigger::Overwrite)?;
    }
    Ok(seq)
}

// ── Introspection ───────────────────────────────────────────────────────────

/// Number of interior updates in flight.
#[must_use]
pub fn updates_nr_pending(fs: &Fs) -> usize {
    fs.interior.lock.lock().list.len()
}

/// One line per pending update: mode, written flag, barrier count, pin.
#[must_use]
pub fn updates_debug_string(fs: &Fs) -> String {
    use std::fmt::Write;
    let inner = fs.interior.lock.lock();
    let mut out = String::new();
    for id in &inner.list {
        if let Some(u) = inner.updates.get(id) {
            let st = u.state();
            let _ = writeln!(
                out,
                "{} m {:?} w {} r {} j {:?}",
                u.id.0,
                st.mode,
                st.nodes_written,
                u.refs.load(Ordering::SeqCst),
                st.journal_pin.seq().map(|s| s.0)
            );
        }
    }
    out
}
