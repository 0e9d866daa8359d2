//! Replica and extent accounting for node pointer keys.
//!
//! Every new pointer key is registered before it can be written
//! (`mark_key_replicas`), and each topology commit marks its pointer
//! deltas with [`Trigger::Insert`] / [`Trigger::Overwrite`] so sector
//! usage tracks the reachable pointer set exactly.

use parking_lot::Mutex;
use sfs_error::{Result, StoreError};
use sfs_key::KeyEntry;
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

/// Direction of a commit-time pointer mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Insert,
    Overwrite,
}

#[derive(Debug, Default)]
struct ReplicaInner {
    /// Known replica groupings (the device sets data has been written
    /// across), recorded before first write.
    entries: BTreeSet<Vec<u8>>,
    /// Live sectors per (dev, start sector) extent.
    extent_sectors: HashMap<(u8, u64), i64>,
}

/// Tracks which device sets carry metadata and how many sectors each
/// pointer extent accounts for.
#[derive(Debug, Default)]
pub struct ReplicaAccounting {
    inner: Mutex<ReplicaInner>,
}

impl ReplicaAccounting {
    #[must_use]
    pub fn new() -> ReplicaAccounting {
        ReplicaAccounting::default()
    }

    /// Record the replica grouping of `key` so recovery knows which
    /// device sets must be readable. Fails on keys with no pointers.
    pub fn mark_key_replicas(&self, key: &KeyEntry) -> Result<()> {
        let Some(ptr) = key.as_btree_ptr() else {
            return Err(StoreError::Corruption {
                location: format!("key {}", key.pos),
                detail: "replica mark on a key with no pointers".to_owned(),
            });
        };
        let mut devs: Vec<u8> = ptr.ptrs().iter().map(|p| p.dev.0).collect();
        devs.sort_unstable();
        devs.dedup();
        if devs.is_empty() {
            return Err(StoreError::Corruption {
                location: format!("key {}", key.pos),
                detail: "pointer key with empty replica set".to_owned(),
            });
        }
        self.inner.lock().entries.insert(devs);
        Ok(())
    }

    /// Apply a commit-time mark for `key`'s extents, `sectors` per
    /// replica pointer.
    pub fn trans_mark_key(&self, key: &KeyEntry, sectors: u32, trigger: Trigger) -> Result<()> {
        let Some(ptr) = key.as_btree_ptr() else {
            // Whiteouts carry no pointers; nothing to account.
            return Ok(());
        };
        let delta = match trigger {
            Trigger::Insert => i64::from(sectors),
            Trigger::Overwrite => -i64::from(sectors),
        };
        let mut inner = self.inner.lock();
        for p in ptr.ptrs() {
            let slot = inner.extent_sectors.entry((p.dev.0, p.addr.0)).or_insert(0);
            *slot += delta;
            trace!(
                target: "sfs::alloc::replicas",
                event = "trans_mark",
                dev = p.dev.0,
                sector = p.addr.0,
                delta = delta,
                live = *slot
            );
            if *slot < 0 {
                return Err(StoreError::Corruption {
                    location: format!("dev {} sector {}", p.dev.0, p.addr.0),
                    detail: "extent sector count went negative".to_owned(),
                });
            }
        }
        inner.extent_sectors.retain(|_, v| *v != 0);
        Ok(())
    }

    /// Number of extents with live sectors (the net pointer set).
    #[must_use]
    pub fn live_extents(&self) -> usize {
        self.inner.lock().extent_sectors.len()
    }

    /// Total live sectors across all extents.
    #[must_use]
    pub fn live_sectors(&self) -> i64 {
        self.inner.lock().extent_sectors.values().sum()
    }

    /// Replica groupings seen so far.
    #[must_use]
    pub fn replica_entries(&self) -> Vec<Vec<u8>> {
        self.inner.lock().entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_key::{BtreePtr, ExtentPtr};
    use sfs_types::{DeviceIdx, KeyPos, SectorAddr};

    fn key_on(devs: &[(u8, u64)]) -> KeyEntry {
        KeyEntry::ptr(
            KeyPos::new(1, 1),
            BtreePtr::V1 {
                ptrs: devs
                    .iter()
                    .map(|&(d, a)| ExtentPtr {
                        dev: DeviceIdx(d),
                        addr: SectorAddr(a),
                    })
                    .collect(),
            },
        )
    }

    #[test]
    fn insert_then_overwrite_nets_to_zero() {
        let r = ReplicaAccounting::new();
        let k = key_on(&[(0, 64), (1, 64)]);
        r.mark_key_replicas(&k).unwrap();

        r.trans_mark_key(&k, 16, Trigger::Insert).unwrap();
        assert_eq!(r.live_extents(), 2);
        assert_eq!(r.live_sectors(), 32);

        r.trans_mark_key(&k, 16, Trigger::Overwrite).unwrap();
        assert_eq!(r.live_extents(), 0);
        assert_eq!(r.live_sectors(), 0);
    }

    #[test]
    fn overwrite_without_insert_is_corruption() {
        let r = ReplicaAccounting::new();
        let k = key_on(&[(0, 0)]);
        assert!(r.trans_mark_key(&k, 8, Trigger::Overwrite).is_err());
    }

    #[test]
    fn whiteouts_are_ignored() {
        let r = ReplicaAccounting::new();
        let w = KeyEntry::whiteout(KeyPos::new(2, 2));
        r.trans_mark_key(&w, 8, Trigger::Insert).unwrap();
        assert_eq!(r.live_extents(), 0);
        assert!(r.mark_key_replicas(&w).is_err());
    }

    #[test]
    fn replica_entries_deduplicate_device_sets() {
        let r = ReplicaAccounting::new();
        r.mark_key_replicas(&key_on(&[(1, 0), (0, 0)])).unwrap();
        r.mark_key_replicas(&key_on(&[(0, 64), (1, 64)])).unwrap();
        assert_eq!(r.replica_entries(), vec![vec![0, 1]]);
    }
}
