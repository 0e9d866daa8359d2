#![forbid(unsafe_code)]
//! Append journal for btree topology changes.
//!
//! The journal is a sequence of commit records, each carrying btree-key
//! entries (parent insertions) and a complete snapshot of btree roots.
//! Space is admitted through pre-reservations; entries stay live until
//! every pin at or below their sequence number is dropped.
//!
//! Entry kinds: `BtreeKeys` (an interior-node insertion, replayed into
//! its parent) and `BtreeRoot` (root registry snapshot).

use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use sfs_error::{Result, StoreError};
use sfs_key::{decode_key, encode_key, KeyEntry, KeyFormat};
use sfs_types::{BtreeId, JournalSeq, Level};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// One journalled mutation or root snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// Keys inserted into an interior node of `btree_id` at `level`.
    BtreeKeys {
        btree_id: BtreeId,
        level: Level,
        key: KeyEntry,
    },
    /// The root of `btree_id` (pointer key of the root node).
    BtreeRoot {
        btree_id: BtreeId,
        level: Level,
        key: KeyEntry,
    },
}

impl JournalEntry {
    #[must_use]
    pub fn btree_id(&self) -> BtreeId {
        match self {
            JournalEntry::BtreeKeys { btree_id, .. } | JournalEntry::BtreeRoot { btree_id, .. } => {
                *btree_id
            }
        }
    }

    /// Encoded size, including the entry header word.
    #[must_use]
    pub fn u64s(&self) -> usize {
        let key = match self {
            JournalEntry::BtreeKeys { key, .. } | JournalEntry::BtreeRoot { key, .. } => key,
        };
        1 + key.u64s()
    }
}

const ENTRY_KIND_BTREE_KEYS: u64 = 1;
const ENTRY_KIND_BTREE_ROOT: u64 = 2;

fn encode_entry(entry: &JournalEntry, out: &mut Vec<u64>) {
    let (kind, btree_id, level, key) = match entry {
        JournalEntry::BtreeKeys {
            btree_id,
            level,
            key,
        } => (ENTRY_KIND_BTREE_KEYS, btree_id, level, key),
        JournalEntry::BtreeRoot {
            btree_id,
            level,
            key,
        } => (ENTRY_KIND_BTREE_ROOT, btree_id, level, key),
    };
    out.push(kind | (u64::from(btree_id.index() as u8) << 8) | (u64::from(level.0) << 16));
    encode_key(key, &KeyFormat::FULL, out);
}

fn decode_entry(words: &[u64]) -> Result<(JournalEntry, usize)> {
    let corrupt = |detail: String| StoreError::Corruption {
        location: "journal entry".to_owned(),
        detail,
    };
    let header = *words.first().ok_or_else(|| corrupt("empty entry".into()))?;
    let kind = header & 0xff;
    let btree_id = BtreeId::from_index(u8::try_from((header >> 8) & 0xff).expect("masked"))
        .map_err(|e| corrupt(e.to_string()))?;
    let level = Level(u8::try_from((header >> 16) & 0xff).expect("masked"));

    let (key, used) = decode_key(&words[1..], &KeyFormat::FULL)?;
    let entry = match kind {
        ENTRY_KIND_BTREE_KEYS => JournalEntry::BtreeKeys {
            btree_id,
            level,
            key,
        },
        ENTRY_KIND_BTREE_ROOT => JournalEntry::BtreeRoot {
            btree_id,
            level,
            key,
        },
        other => return Err(corrupt(format!("unknown entry kind {other}"))),
    };
    Ok((entry, 1 + used))
}

/// One committed journal write.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub seq: JournalSeq,
    pub entries: Vec<JournalEntry>,
    pub crc32c: u32,
}

impl CommitRecord {
    fn encode_payload(entries: &[JournalEntry]) -> Vec<u64> {
        let mut words = Vec::new();
        for e in entries {
            encode_entry(e, &mut words);
        }
        words
    }

    /// Decode the payload back into entries, verifying the checksum.
    pub fn decode(&self) -> Result<Vec<JournalEntry>> {
        let words = Self::encode_payload(&self.entries);
        let crc = payload_crc(&words);
        if crc != self.crc32c {
            return Err(StoreError::Corruption {
                location: format!("journal seq {}", self.seq.0),
                detail: format!("crc mismatch: {:#x} != {:#x}", crc, self.crc32c),
            });
        }
        let mut out = Vec::new();
        let mut off = 0;
        while off < words.len() {
            let (entry, used) = decode_entry(&words[off..])?;
            out.push(entry);
            off += used;
        }
        Ok(out)
    }
}

fn payload_crc(words: &[u64]) -> u32 {
    let mut bytes = Vec::with_capacity(words.len() * 8);
    for w in words {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    crc32c::crc32c(&bytes)
}

/// A pre-reservation of journal space, returned via
/// [`Journal::preres_put`] whether or not it was used.
#[derive(Debug, Default)]
pub struct JournalPreres {
    u64s: u64,
}

impl JournalPreres {
    #[must_use]
    pub fn reserved_u64s(&self) -> u64 {
        self.u64s
    }
}

/// A reference keeping journal entries at or above a sequence number
/// from being reclaimed.
#[derive(Debug, Default)]
pub struct JournalPin {
    seq: Option<JournalSeq>,
}

impl JournalPin {
    #[must_use]
    pub fn seq(&self) -> Option<JournalSeq> {
        self.seq
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.seq.is_some()
    }
}

// Flag arguments for preres_get.
/// Do not wait for space; fail with `WouldBlock`.
pub const JOURNAL_RES_NONBLOCK: u32 = 1 << 0;
/// The caller is (or acts on behalf of) journal reclaim: it may dip into
/// the reclaim-only pool and must never wait on reclaim itself.
pub const JOURNAL_RES_RECLAIM: u32 = 1 << 1;

struct JournalInner {
    next_seq: JournalSeq,
    records: Vec<CommitRecord>,
    /// Space admission: capacity minus outstanding preres minus live
    /// (unreclaimed) record payload.
    capacity_u64s: u64,
    reserved_u64s: u64,
    used_u64s: u64,
    /// Floor kept free for reclaim-flagged reservations.
    reclaim_floor_u64s: u64,
    pins: BTreeMap<u64, usize>,
    err: bool,
}

impl JournalInner {
    fn free_u64s(&self, reclaim: bool) -> u64 {
        let floor = if reclaim { 0 } else { self.reclaim_floor_u64s };
        self.capacity_u64s
            .saturating_sub(self.reserved_u64s)
            .saturating_sub(self.used_u64s)
            .saturating_sub(floor)
    }

    fn oldest_pinned(&self) -> Option<JournalSeq> {
        self.pins.keys().next().copied().map(JournalSeq)
    }

    /// Drop records no pin can still need, reclaiming their space.
    fn reclaim(&mut self) {
        let keep_from = self.oldest_pinned().unwrap_or(self.next_seq);
        let mut freed = 0_u64;
        self.records.retain(|r| {
            if r.seq < keep_from {
                freed += Self::record_u64s(r);
                false
            } else {
                true
            }
        });
        self.used_u64s = self.used_u64s.saturating_sub(freed);
    }

    fn record_u64s(r: &CommitRecord) -> u64 {
        r.entries.iter().map(|e| e.u64s() as u64).sum()
    }
}

/// The journal. One per filesystem.
pub struct Journal {
    inner: Mutex<JournalInner>,
    space: Condvar,
}

impl Journal {
    #[must_use]
    pub fn new(capacity_u64s: u64, reclaim_floor_u64s: u64) -> Journal {
        Journal {
            inner: Mutex::new(JournalInner {
                next_seq: JournalSeq(1),
                records: Vec::new(),
                capacity_u64s,
                reserved_u64s: 0,
                used_u64s: 0,
                reclaim_floor_u64s,
                pins: BTreeMap::new(),
                err: false,
            }),
            space: Condvar::new(),
        }
    }

    /// Whether the journal has failed permanently.
    #[must_use]
    pub fn error(&self) -> bool {
        self.inner.lock().err
    }

    /// Mark the journal failed. All future reservations and commits
    /// return `JournalError`.
    pub fn set_error(&self) {
        let mut inner = self.inner.lock();
        if !inner.err {
            error!(target: "sfs::journal", event = "journal_error");
            inner.err = true;
        }
        drop(inner);
        self.space.notify_all();
    }

    /// Sequence number the next commit will receive.
    #[must_use]
    pub fn cur_seq(&self) -> JournalSeq {
        self.inner.lock().next_seq
    }

    /// Acquire `u64s` of reservation into `preres`.
    ///
    /// With `JOURNAL_RES_NONBLOCK`, failure to reserve returns
    /// `WouldBlock`; otherwise the call waits for reclaim to free space.
    pub fn preres_get(
        &self,
        cx: &Cx,
        preres: &mut JournalPreres,
        u64s: u64,
        flags: u32,
    ) -> Result<()> {
        let reclaim = flags & JOURNAL_RES_RECLAIM != 0;
        let mut inner = self.inner.lock();
        loop {
            if inner.err {
                return Err(StoreError::JournalError);
            }
            if inner.free_u64s(reclaim) >= u64s {
                inner.reserved_u64s += u64s;
                preres.u64s += u64s;
                return Ok(());
            }
            if flags & JOURNAL_RES_NONBLOCK != 0 {
                return Err(StoreError::WouldBlock);
            }
            cx.checkpoint().map_err(|_| StoreError::Cancelled)?;
            self.space.wait(&mut inner);
        }
    }

    /// Return an unused (or no longer needed) reservation.
    pub fn preres_put(&self, preres: &mut JournalPreres) {
        if preres.u64s == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.reserved_u64s = inner.reserved_u64s.saturating_sub(preres.u64s);
        preres.u64s = 0;
        drop(inner);
        self.space.notify_all();
    }

    /// Pin the journal at `seq` (typically the seq of a commit whose
    /// effects are not yet durable elsewhere).
    pub fn pin_add(&self, pin: &mut JournalPin, seq: JournalSeq) {
        let mut inner = self.inner.lock();
        if let Some(cur) = pin.seq {
            // Keep the older of the two.
            if cur <= seq {
                return;
            }
            Self::pin_drop_locked(&mut inner, cur);
        }
        *inner.pins.entry(seq.0).or_insert(0) += 1;
        pin.seq = Some(seq);
    }

    /// Copy `src`'s pin into `dst`, keeping `dst`'s older seq if it
    /// already holds one. `src` is left untouched.
    pub fn pin_copy(&self, dst: &mut JournalPin, src: &JournalPin) {
        let Some(seq) = src.seq else { return };
        self.pin_add(dst, seq);
    }

    /// Release a pin. Dropping the oldest pin reclaims journal space and
    /// wakes reservation waiters.
    pub fn pin_drop(&self, pin: &mut JournalPin) {
        let Some(seq) = pin.seq.take() else { return };
        let mut inner = self.inner.lock();
        Self::pin_drop_locked(&mut inner, seq);
        inner.reclaim();
        drop(inner);
        self.space.notify_all();
    }

    fn pin_drop_locked(inner: &mut JournalInner, seq: JournalSeq) {
        match inner.pins.get_mut(&seq.0) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.pins.remove(&seq.0);
            }
            None => panic!("dropping unregistered journal pin at seq {}", seq.0),
        }
    }

    /// Oldest sequence number any pin still needs.
    #[must_use]
    pub fn oldest_pinned(&self) -> Option<JournalSeq> {
        self.inner.lock().oldest_pinned()
    }

    /// Commit `entries` as one record. The caller is responsible for
    /// having merged a complete root snapshot into `entries`.
    pub fn commit(&self, entries: Vec<JournalEntry>) -> Result<JournalSeq> {
        let mut inner = self.inner.lock();
        if inner.err {
            return Err(StoreError::JournalError);
        }
        let words = CommitRecord::encode_payload(&entries);
        let seq = inner.next_seq;
        inner.next_seq = JournalSeq(seq.0 + 1);
        inner.used_u64s += words.len() as u64;
        let record = CommitRecord {
            seq,
            entries,
            crc32c: payload_crc(&words),
        };
        debug!(
            target: "sfs::journal",
            event = "commit",
            seq = seq.0,
            entries = record.entries.len(),
            u64s = words.len()
        );
        inner.records.push(record);
        if inner.used_u64s > inner.capacity_u64s {
            warn!(
                target: "sfs::journal",
                event = "journal_overfull",
                used = inner.used_u64s,
                capacity = inner.capacity_u64s
            );
        }
        Ok(seq)
    }

    /// All live (unreclaimed) commit records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<CommitRecord> {
        self.inner.lock().records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_key::{BtreePtr, ExtentPtr};
    use sfs_types::{DeviceIdx, KeyPos, SectorAddr};

    fn key(pos: KeyPos) -> KeyEntry {
        KeyEntry::ptr(
            pos,
            BtreePtr::V1 {
                ptrs: vec![ExtentPtr {
                    dev: DeviceIdx(0),
                    addr: SectorAddr(64),
                }],
            },
        )
    }

    fn root_entry(pos: KeyPos) -> JournalEntry {
        JournalEntry::BtreeRoot {
            btree_id: BtreeId::Extents,
            level: Level(1),
            key: key(pos),
        }
    }

    #[test]
    fn commit_assigns_monotonic_seqs() {
        let j = Journal::new(1 << 20, 0);
        let s1 = j.commit(vec![root_entry(KeyPos::new(1, 1))]).unwrap();
        let s2 = j.commit(vec![root_entry(KeyPos::new(2, 2))]).unwrap();
        assert!(s2 > s1);
        assert_eq!(j.records().len(), 2);
    }

    #[test]
    fn records_decode_with_valid_crc() {
        let j = Journal::new(1 << 20, 0);
        let entries = vec![
            JournalEntry::BtreeKeys {
                btree_id: BtreeId::Inodes,
                level: Level(1),
                key: key(KeyPos::new(9, 9)),
            },
            root_entry(KeyPos::new(3, 0)),
        ];
        j.commit(entries.clone()).unwrap();

        let records = j.records();
        assert_eq!(records[0].decode().unwrap(), entries);
    }

    #[test]
    fn preres_nonblock_fails_when_full() {
        let cx = Cx::for_testing();
        let j = Journal::new(100, 0);
        let mut a = JournalPreres::default();
        j.preres_get(&cx, &mut a, 80, 0).unwrap();

        let mut b = JournalPreres::default();
        let err = j.preres_get(&cx, &mut b, 40, JOURNAL_RES_NONBLOCK);
        assert!(matches!(err, Err(StoreError::WouldBlock)));

        j.preres_put(&mut a);
        j.preres_get(&cx, &mut b, 40, JOURNAL_RES_NONBLOCK).unwrap();
        j.preres_put(&mut b);
    }

    #[test]
    fn reclaim_flag_reaches_into_floor() {
        let cx = Cx::for_testing();
        let j = Journal::new(100, 40);
        let mut a = JournalPreres::default();

        // Normal getters see only capacity - floor.
        assert!(matches!(
            j.preres_get(&cx, &mut a, 80, JOURNAL_RES_NONBLOCK),
            Err(StoreError::WouldBlock)
        ));
        j.preres_get(&cx, &mut a, 80, JOURNAL_RES_NONBLOCK | JOURNAL_RES_RECLAIM)
            .unwrap();
        j.preres_put(&mut a);
    }

    #[test]
    fn pins_hold_records_until_dropped() {
        let j = Journal::new(1 << 20, 0);
        let mut pin = JournalPin::default();

        let s1 = j.commit(vec![root_entry(KeyPos::new(1, 0))]).unwrap();
        j.pin_add(&mut pin, s1);
        let _s2 = j.commit(vec![root_entry(KeyPos::new(2, 0))]).unwrap();

        // A later pin_add keeps the older seq.
        j.pin_add(&mut pin, JournalSeq(s1.0 + 1));
        assert_eq!(pin.seq(), Some(s1));

        j.pin_drop(&mut pin);
        assert_eq!(j.oldest_pinned(), None);
        assert!(!pin.is_active());
        // Records reclaimed once nothing pins them.
        assert!(j.records().is_empty());
    }

    #[test]
    fn pin_copy_transfers_oldest() {
        let j = Journal::new(1 << 20, 0);
        let mut src = JournalPin::default();
        let mut dst = JournalPin::default();

        let s1 = j.commit(vec![root_entry(KeyPos::new(1, 0))]).unwrap();
        let s2 = j.commit(vec![root_entry(KeyPos::new(2, 0))]).unwrap();
        j.pin_add(&mut src, s1);
        j.pin_add(&mut dst, s2);

        j.pin_copy(&mut dst, &src);
        assert_eq!(dst.seq(), Some(s1));

        j.pin_drop(&mut src);
        j.pin_drop(&mut dst);
        assert_eq!(j.oldest_pinned(), None);
    }

    #[test]
    fn error_state_rejects_new_work() {
        let cx = Cx::for_testing();
        let j = Journal::new(1 << 20, 0);
        j.set_error();

        assert!(matches!(
            j.commit(vec![root_entry(KeyPos::new(1, 0))]),
            Err(StoreError::JournalError)
        ));
        let mut p = JournalPreres::default();
        assert!(matches!(
            j.preres_get(&cx, &mut p, 8, 0),
            Err(StoreError::JournalError)
        ));
    }
}
