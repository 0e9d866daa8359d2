#![forbid(unsafe_code)]
//! Sector allocation for btree nodes.
//!
//! Space is carved into fixed-size buckets per device. Foreground
//! allocation hands out *open buckets*: short-term refcounted
//! reservations that pin a bucket against reuse until every holder has
//! dropped it. A persistent btree write point carries one open bucket
//! per replica and is refilled as buckets fill up.
//!
//! Reserve classes let topology changes make forward progress while the
//! allocator is constrained: `None` for ordinary callers, `Btree` for
//! interior updates, `Alloc` for allocator-driven work that must never
//! wait on itself.

pub mod replicas;

use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use sfs_error::{Result, StoreError};
use sfs_key::ExtentPtr;
use sfs_types::{DeviceIdx, ReplicaCount, SectorAddr};
use tracing::{debug, trace};

/// Tiered allocation reserves, shallowest to deepest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReserveClass {
    None,
    Btree,
    Alloc,
}

/// Slab handle to an open bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenBucketId(u32);

#[derive(Debug)]
struct OpenBucket {
    dev: DeviceIdx,
    bucket: u64,
    cursor: SectorAddr,
    sectors_free: u32,
    refs: u32,
}

#[derive(Debug, Default)]
struct WritePointState {
    obs: Vec<OpenBucketId>,
}

/// A filled write point: one open bucket per replica, each holding at
/// least one free sector. `sectors_free` is the minimum across replicas.
#[derive(Debug)]
pub struct WritePoint {
    obs: Vec<OpenBucketId>,
    pub sectors_free: u32,
}

struct AllocInner {
    bucket_sectors: u32,
    nr_devices: u8,
    /// Free bucket indices per device.
    free: Vec<Vec<u64>>,
    /// Open bucket slab.
    obs: Vec<Option<OpenBucket>>,
    ob_free: Vec<u32>,
    nr_open: usize,
    /// Persistent btree write point.
    btree_wp: WritePointState,
    /// Bucket floors reserved for the deeper classes.
    reserve_btree: usize,
    reserve_alloc: usize,
    /// Admission counter for disk reservations. Goes negative when
    /// `nofail` reservations overdraw.
    free_sectors: i64,
}

impl AllocInner {
    fn free_buckets(&self) -> usize {
        self.free.iter().map(Vec::len).sum()
    }

    fn floor(&self, class: ReserveClass) -> usize {
        match class {
            ReserveClass::None => self.reserve_btree + self.reserve_alloc,
            ReserveClass::Btree => self.reserve_alloc,
            ReserveClass::Alloc => 0,
        }
    }

    fn ob(&mut self, id: OpenBucketId) -> &mut OpenBucket {
        self.obs[id.0 as usize]
            .as_mut()
            .expect("stale open bucket id")
    }

    fn ob_alloc(&mut self, ob: OpenBucket) -> OpenBucketId {
        self.nr_open += 1;
        if let Some(idx) = self.ob_free.pop() {
            self.obs[idx as usize] = Some(ob);
            OpenBucketId(idx)
        } else {
            self.obs.push(Some(ob));
            OpenBucketId(u32::try_from(self.obs.len() - 1).expect("slab fits u32"))
        }
    }

    /// Pop a free bucket on the least-loaded device not already in `used`.
    fn pop_bucket(&mut self, used: &[DeviceIdx]) -> Option<(DeviceIdx, u64)> {
        let mut best: Option<usize> = None;
        for dev in 0..usize::from(self.nr_devices) {
            if used.iter().any(|d| usize::from(d.0) == dev) || self.free[dev].is_empty() {
                continue;
            }
            best = match best {
                Some(b) if self.free[b].len() >= self.free[dev].len() => Some(b),
                _ => Some(dev),
            };
        }
        let dev = best?;
        let bucket = self.free[dev].pop()?;
        Some((DeviceIdx(u8::try_from(dev).expect("device count fits u8")), bucket))
    }

    fn ob_put(&mut self, id: OpenBucketId) -> bool {
        let bucket_sectors = self.bucket_sectors;
        let ob = self.ob(id);
        assert!(ob.refs > 0, "open bucket over-released");
        ob.refs -= 1;
        if ob.refs > 0 {
            return false;
        }
        let dev = ob.dev;
        let bucket = ob.bucket;
        let untouched = ob.sectors_free == bucket_sectors;
        self.obs[id.0 as usize] = None;
        self.ob_free.push(id.0);
        self.nr_open -= 1;
        if untouched {
            // Nothing was written; the bucket goes straight back.
            self.free[usize::from(dev.0)].push(bucket);
        }
        untouched
    }
}

/// The sector allocator. One per filesystem.
pub struct SectorAllocator {
    inner: Mutex<AllocInner>,
    buckets_freed: Condvar,
}

impl SectorAllocator {
    /// `buckets_per_dev` buckets of `bucket_sectors` sectors on each of
    /// `nr_devices` devices. `reserve_btree` / `reserve_alloc` buckets
    /// are kept back for the corresponding reserve classes.
    #[must_use]
    pub fn new(
        nr_devices: u8,
        buckets_per_dev: u64,
        bucket_sectors: u32,
        reserve_btree: usize,
        reserve_alloc: usize,
    ) -> SectorAllocator {
        assert!(nr_devices > 0 && buckets_per_dev > 0 && bucket_sectors > 0);
        let free = (0..nr_devices)
            .map(|_| (0..buckets_per_dev).rev().collect())
            .collect();
        SectorAllocator {
            inner: Mutex::new(AllocInner {
                bucket_sectors,
                nr_devices,
                free,
                obs: Vec::new(),
                ob_free: Vec::new(),
                nr_open: 0,
                btree_wp: WritePointState::default(),
                reserve_btree,
                reserve_alloc,
                free_sectors: i64::try_from(
                    u64::from(nr_devices) * buckets_per_dev * u64::from(bucket_sectors),
                )
                .expect("device capacity fits i64"),
            }),
            buckets_freed: Condvar::new(),
        }
    }

    /// Fill the btree write point to `replicas` open buckets, each with
    /// free sectors, and return it with every bucket's refcount bumped.
    ///
    /// The write point persists across calls: a bucket left half-full by
    /// one node allocation is offered to the next, which is why callers
    /// must handle `sectors_free` coming back short.
    pub fn alloc_sectors_start(
        &self,
        cx: &Cx,
        replicas: ReplicaCount,
        class: ReserveClass,
        nowait: bool,
    ) -> Result<WritePoint> {
        let want = usize::from(replicas.get());
        let mut inner = self.inner.lock();
        loop {
            // Drop spent buckets from the write point.
            let obs: Vec<OpenBucketId> = std::mem::take(&mut inner.btree_wp.obs);
            for id in obs {
                if inner.ob(id).sectors_free == 0 {
                    inner.ob_put(id);
                } else {
                    inner.btree_wp.obs.push(id);
                }
            }

            let missing = want.saturating_sub(inner.btree_wp.obs.len());
            if missing == 0 {
                break;
            }

            if inner.free_buckets() <= inner.floor(class) {
                if inner.free_buckets() == 0 && inner.nr_open == 0 {
                    return Err(StoreError::NoSpaceDisk {
                        needed_sectors: u64::from(inner.bucket_sectors),
                    });
                }
                if nowait {
                    return Err(StoreError::WouldBlock);
                }
                cx.checkpoint().map_err(|_| StoreError::Cancelled)?;
                self.buckets_freed.wait(&mut inner);
                continue;
            }

            let used: Vec<DeviceIdx> = inner
                .btree_wp
                .obs
                .iter()
                .map(|&id| inner.obs[id.0 as usize].as_ref().expect("live ob").dev)
                .collect();
            let Some((dev, bucket)) = inner.pop_bucket(&used) else {
                // Free buckets exist but not on distinct devices; fall
                // back to reusing a device rather than failing.
                let Some((dev, bucket)) = inner.pop_bucket(&[]) else {
                    if nowait {
                        return Err(StoreError::WouldBlock);
                    }
                    cx.checkpoint().map_err(|_| StoreError::Cancelled)?;
                    self.buckets_freed.wait(&mut inner);
                    continue;
                };
                let sectors = inner.bucket_sectors;
                let base = SectorAddr(bucket * u64::from(sectors));
                let id = inner.ob_alloc(OpenBucket {
                    dev,
                    bucket,
                    cursor: base,
                    sectors_free: sectors,
                    refs: 1,
                });
                inner.btree_wp.obs.push(id);
                continue;
            };
            let sectors = inner.bucket_sectors;
            let base = SectorAddr(bucket * u64::from(sectors));
            let id = inner.ob_alloc(OpenBucket {
                dev,
                bucket,
                cursor: base,
                sectors_free: sectors,
                refs: 1,
            });
            trace!(
                target: "sfs::alloc",
                event = "open_bucket",
                dev = dev.0,
                bucket = bucket,
                class = ?class
            );
            inner.btree_wp.obs.push(id);
        }

        let obs: Vec<OpenBucketId> = inner.btree_wp.obs[..want].to_vec();
        let mut sectors_free = u32::MAX;
        for &id in &obs {
            let ob = inner.ob(id);
            ob.refs += 1;
            sectors_free = sectors_free.min(ob.sectors_free);
        }
        Ok(WritePoint { obs, sectors_free })
    }

    /// Mark write-point buckets with fewer than `need` free sectors as
    /// spent, so a retry gets fresh buckets instead of repeating the
    /// same short fill.
    pub fn writepoint_retire_short(&self, wp: &mut WritePoint, need: u32) {
        let mut inner = self.inner.lock();
        for &id in &wp.obs {
            let ob = inner.ob(id);
            if ob.sectors_free < need {
                ob.sectors_free = 0;
            }
        }
        wp.sectors_free = 0;
    }

    /// Carve `sectors` out of every replica bucket in the write point,
    /// returning one extent pointer per replica.
    pub fn alloc_sectors_append_ptrs(&self, wp: &mut WritePoint, sectors: u32) -> Vec<ExtentPtr> {
        assert!(sectors <= wp.sectors_free, "write point too short");
        let mut inner = self.inner.lock();
        let mut ptrs = Vec::with_capacity(wp.obs.len());
        for &id in &wp.obs {
            let ob = inner.ob(id);
            assert!(ob.sectors_free >= sectors);
            ptrs.push(ExtentPtr {
                dev: ob.dev,
                addr: ob.cursor,
            });
            ob.cursor = ob
                .cursor
                .checked_add(u64::from(sectors))
                .expect("bucket cursor overflow");
            ob.sectors_free -= sectors;
        }
        wp.sectors_free -= sectors;
        ptrs
    }

    /// Take an extra reference on each of the write point's open buckets
    /// and return their ids; the caller now co-owns them and must
    /// eventually call [`SectorAllocator::open_buckets_put`].
    #[must_use]
    pub fn open_buckets_get(&self, wp: &WritePoint) -> Vec<OpenBucketId> {
        let mut inner = self.inner.lock();
        for &id in &wp.obs {
            inner.ob(id).refs += 1;
        }
        wp.obs.clone()
    }

    /// Release the write point's own references.
    pub fn alloc_sectors_done(&self, wp: WritePoint) {
        let mut inner = self.inner.lock();
        let mut freed = false;
        for id in wp.obs {
            freed |= inner.ob_put(id);
        }
        drop(inner);
        if freed {
            self.buckets_freed.notify_all();
        }
    }

    /// Drop open-bucket references obtained from
    /// [`SectorAllocator::open_buckets_get`].
    pub fn open_buckets_put(&self, ids: &[OpenBucketId]) {
        if ids.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let mut freed = false;
        for &id in ids {
            freed |= inner.ob_put(id);
        }
        drop(inner);
        if freed {
            self.buckets_freed.notify_all();
        }
    }

    /// Number of live open buckets (diagnostics and tests).
    #[must_use]
    pub fn nr_open_buckets(&self) -> usize {
        self.inner.lock().nr_open
    }

    // ── Disk reservations ───────────────────────────────────────────────

    /// Reserve `sectors · replicas` sectors against the free-space
    /// counter. With `nofail`, the reservation is granted even when it
    /// overdraws the counter.
    pub fn disk_reservation_get(
        &self,
        sectors: u64,
        replicas: ReplicaCount,
        nofail: bool,
    ) -> Result<DiskReservation> {
        let total = sectors * u64::from(replicas.get());
        let signed = i64::try_from(total).expect("reservation fits i64");
        let mut inner = self.inner.lock();
        if inner.free_sectors < signed && !nofail {
            return Err(StoreError::NoSpaceDisk {
                needed_sectors: total,
            });
        }
        inner.free_sectors -= signed;
        debug!(
            target: "sfs::alloc",
            event = "disk_reservation",
            sectors = total,
            remaining = inner.free_sectors
        );
        Ok(DiskReservation { sectors: total })
    }

    /// Return an unused reservation.
    pub fn disk_reservation_put(&self, res: &mut DiskReservation) {
        if res.sectors == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.free_sectors += i64::try_from(res.sectors).expect("reservation fits i64");
        res.sectors = 0;
    }

    #[must_use]
    pub fn free_sectors(&self) -> i64 {
        self.inner.lock().free_sectors
    }
}

/// Sectors reserved but not yet attributed to specific buckets.
/// Returned via [`SectorAllocator::disk_reservation_put`].
#[derive(Debug, Default)]
pub struct DiskReservation {
    sectors: u64,
}

impl DiskReservation {
    #[must_use]
    pub fn sectors(&self) -> u64 {
        self.sectors
    }
}
