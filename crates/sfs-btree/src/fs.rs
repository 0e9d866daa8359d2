//! The filesystem context: every engine entry point takes `&Fs`.
//!
//! Owns the journal, the sector allocator, the node cache, the root
//! registry, and the interior-update state (update registry, reserve
//! cache, finalizer worker). Lifecycle is `mount -> ... -> unmount`;
//! unmount drains pending interior updates and joins the worker.

use crate::cache::NodeCache;
use crate::interior::{InteriorState, WorkerMsg};
use crate::node::Node;
use crate::root::RootRegistry;
use crate::{format, interior};
use asupersync::Cx;
use parking_lot::{Mutex, RwLock};
use sfs_alloc::replicas::ReplicaAccounting;
use sfs_alloc::SectorAllocator;
use sfs_block::SectorDevice;
use sfs_error::Result;
use sfs_journal::Journal;
use sfs_types::{NodeSeq, ReplicaCount};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info};

/// Mount-time configuration.
#[derive(Debug, Clone)]
pub struct StoreOpts {
    /// Sectors per btree node.
    pub btree_node_sectors: u32,
    /// Replicas metadata is written with.
    pub metadata_replicas: ReplicaCount,
    /// Use v2 pointer keys (min_key + seq + sector bookkeeping).
    pub ptr_v2: bool,
    /// Journal space in u64s.
    pub journal_capacity_u64s: u64,
    /// Journal space held back for reclaim-flagged reservations.
    pub journal_reclaim_floor_u64s: u64,
    /// Allocator geometry.
    pub buckets_per_dev: u64,
    pub bucket_sectors: u32,
    /// Node cache bound; reaching it cannibalises the LRU.
    pub node_cache_capacity: usize,
}

impl Default for StoreOpts {
    fn default() -> Self {
        StoreOpts {
            btree_node_sectors: 16,
            metadata_replicas: ReplicaCount(1),
            ptr_v2: true,
            journal_capacity_u64s: 1 << 16,
            journal_reclaim_floor_u64s: 1 << 10,
            buckets_per_dev: 256,
            bucket_sectors: 128,
            node_cache_capacity: crate::cache::DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl StoreOpts {
    #[must_use]
    pub fn btree_max_u64s(&self) -> usize {
        format::btree_max_u64s(self.btree_node_sectors)
    }

    /// A replacement bset above this splits in two.
    #[must_use]
    pub fn split_threshold(&self) -> usize {
        self.btree_max_u64s() * 2 / 3
    }

    /// Foreground merge fires below this.
    #[must_use]
    pub fn merge_threshold(&self) -> usize {
        self.btree_max_u64s() / 3
    }

    /// Damping point for the merge size estimate.
    #[must_use]
    pub fn merge_hysteresis(&self) -> usize {
        self.merge_threshold() + self.merge_threshold() / 4
    }
}

/// The mounted filesystem.
pub struct Fs {
    pub opts: StoreOpts,
    pub device: Arc<dyn SectorDevice>,
    pub journal: Journal,
    pub alloc: SectorAllocator,
    pub replicas: ReplicaAccounting,
    pub cache: NodeCache,
    pub roots: RootRegistry,
    pub interior: InteriorState,
    /// Topology changes don't mix with mark-and-sweep GC.
    pub gc_lock: RwLock<()>,

    hold_writes: AtomicBool,
    held_writes: Mutex<Vec<Arc<Node>>>,
    node_seq: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Fs {
    /// Mount: wire up subsystems and start the interior-update worker.
    pub fn mount(opts: StoreOpts, device: Arc<dyn SectorDevice>) -> Result<Arc<Fs>> {
        let (tx, rx) = crossbeam_channel::unbounded::<WorkerMsg>();
        let journal = Journal::new(opts.journal_capacity_u64s, opts.journal_reclaim_floor_u64s);
        let alloc = SectorAllocator::new(
            device.nr_devices(),
            opts.buckets_per_dev,
            opts.bucket_sectors,
            interior::BTREE_NODE_RESERVE,
            interior::BTREE_NODE_RESERVE / 4,
        );

        let cache = NodeCache::new(opts.node_cache_capacity);

        let fs = Arc::new(Fs {
            opts,
            device,
            journal,
            alloc,
            replicas: ReplicaAccounting::new(),
            cache,
            roots: RootRegistry::new(),
            interior: InteriorState::new(tx),
            gc_lock: RwLock::new(()),
            hold_writes: AtomicBool::new(false),
            held_writes: Mutex::new(Vec::new()),
            node_seq: AtomicU64::new(1),
            worker: Mutex::new(None),
        });

        let worker_fs = Arc::clone(&fs);
        let handle = std::thread::Builder::new()
            .name("sfs-interior-update".to_owned())
            .spawn(move || interior::worker_loop(&worker_fs, &rx))?;
        *fs.worker.lock() = Some(handle);

        info!(
            target: "sfs::fs",
            event = "mount",
            node_sectors = fs.opts.btree_node_sectors,
            replicas = fs.opts.metadata_replicas.get()
        );
        Ok(fs)
    }

    /// Drain pending interior updates and stop the worker. Must be the
    /// last call against this filesystem.
    pub fn unmount(&self) {
        self.flush_interior_updates();
        if let Some(handle) = self.worker.lock().take() {
            let _ = self.interior.worker_tx.send(WorkerMsg::Shutdown);
            let _ = handle.join();
        }
        info!(target: "sfs::fs", event = "unmount");
    }

    /// Block until no interior updates are pending.
    pub fn flush_interior_updates(&self) {
        self.interior.wait_quiescent();
    }

    /// Fresh data generation for a newly filled node.
    pub fn next_node_seq(&self) -> NodeSeq {
        NodeSeq(self.node_seq.fetch_add(1, Ordering::Relaxed))
    }

    // ── Held-writes gate ────────────────────────────────────────────────

    /// Suspend physical node writes; they queue until released. Used to
    /// order write completions deterministically.
    pub fn hold_btree_writes(&self) {
        debug!(target: "sfs::btree::io", event = "writes_held");
        self.hold_writes.store(true, Ordering::SeqCst);
    }

    /// Re-open the gate and perform everything that queued behind it.
    pub fn release_btree_writes(&self, cx: &Cx) {
        debug!(target: "sfs::btree::io", event = "writes_released");
        self.hold_writes.store(false, Ordering::SeqCst);
        crate::io::release_held_writes(self, cx);
    }

    #[must_use]
    pub fn writes_held(&self) -> bool {
        self.hold_writes.load(Ordering::SeqCst)
    }

    pub(crate) fn queue_held_write(&self, b: &Arc<Node>) {
        self.held_writes.lock().push(Arc::clone(b));
    }

    pub(crate) fn take_held_writes(&self) -> Vec<Arc<Node>> {
        std::mem::take(&mut self.held_writes.lock())
    }
}

impl Drop for Fs {
    fn drop(&mut self) {
        // Worker threads hold an Arc<Fs>, so by the time Fs drops the
        // worker is gone; nothing to join. A mounted Fs must be torn
        // down with unmount().
        debug_assert!(self.worker.lock().is_none(), "Fs dropped without unmount");
    }
}
