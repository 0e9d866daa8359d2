#![forbid(unsafe_code)]
//! Core identifier and position newtypes shared across the workspace.
//!
//! Unit-carrying wrappers prevent mixing sectors, sequence numbers, and
//! tree levels. Everything here is `Copy` and serde-serializable.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which btree a node or root belongs to.
///
/// The set of trees is fixed at format time; `BtreeId` indexes the root
/// registry and is recorded in every journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BtreeId {
    Extents = 0,
    Inodes = 1,
    Dirents = 2,
    Alloc = 3,
}

/// Number of distinct btrees (size of the root registry).
pub const BTREE_ID_NR: usize = 4;

impl BtreeId {
    pub const ALL: [BtreeId; BTREE_ID_NR] = [
        BtreeId::Extents,
        BtreeId::Inodes,
        BtreeId::Dirents,
        BtreeId::Alloc,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Decode a journal-encoded id byte.
    pub fn from_index(idx: u8) -> Result<Self, TypeError> {
        match idx {
            0 => Ok(BtreeId::Extents),
            1 => Ok(BtreeId::Inodes),
            2 => Ok(BtreeId::Dirents),
            3 => Ok(BtreeId::Alloc),
            _ => Err(TypeError::InvalidBtreeId { id: idx }),
        }
    }
}

impl fmt::Display for BtreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BtreeId::Extents => "extents",
            BtreeId::Inodes => "inodes",
            BtreeId::Dirents => "dirents",
            BtreeId::Alloc => "alloc",
        };
        f.write_str(name)
    }
}

/// Depth of a node in its tree. Level 0 is a leaf; interior nodes sit
/// at levels 1..[`MAX_DEPTH`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Level(pub u8);

/// Maximum tree depth. A root never sits above level `MAX_DEPTH - 1`.
pub const MAX_DEPTH: u8 = 4;

impl Level {
    #[must_use]
    pub fn is_leaf(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn parent(self) -> Level {
        Level(self.0 + 1)
    }
}

/// Monotonic journal commit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JournalSeq(pub u64);

/// Per-node data generation. Bumped each time a node is rewritten so a
/// stale rewrite request can detect that the node it targeted is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeSeq(pub u64);

impl NodeSeq {
    #[must_use]
    pub fn next(self) -> NodeSeq {
        NodeSeq(self.0 + 1)
    }
}

/// Identifier of one interior-update transaction, used to break the
/// node -> update reference cycle: nodes store the id, the registry maps
/// it back to the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UpdateId(pub u64);

/// Stable index of a device in the member set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdx(pub u8);

/// Sector address on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorAddr(pub u64);

impl SectorAddr {
    /// Add a sector count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, sectors: u64) -> Option<SectorAddr> {
        self.0.checked_add(sectors).map(SectorAddr)
    }
}

/// A count of 512-byte sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorCount(pub u32);

/// Number of replicas metadata is written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaCount(pub u8);

impl ReplicaCount {
    #[must_use]
    pub fn get(self) -> u8 {
        self.0.max(1)
    }
}

/// A position in the total key order: `(inode, offset)` lexicographic.
///
/// Interior-node keys are positions; a child pointer's key position is
/// the child's `max_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyPos {
    pub inode: u64,
    pub offset: u64,
}

/// Smallest position.
pub const POS_MIN: KeyPos = KeyPos {
    inode: 0,
    offset: 0,
};

/// Largest position.
pub const POS_MAX: KeyPos = KeyPos {
    inode: u64::MAX,
    offset: u64::MAX,
};

impl KeyPos {
    #[must_use]
    pub fn new(inode: u64, offset: u64) -> KeyPos {
        KeyPos { inode, offset }
    }

    /// The immediate next position in the total order.
    ///
    /// Adjacent siblings meet at `successor(prev.max_key) == next.min_key`;
    /// calling this on [`POS_MAX`] is a bug.
    #[must_use]
    pub fn successor(self) -> KeyPos {
        assert!(self != POS_MAX, "successor of POS_MAX");
        match self.offset.checked_add(1) {
            Some(offset) => KeyPos {
                inode: self.inode,
                offset,
            },
            None => KeyPos {
                inode: self.inode + 1,
                offset: 0,
            },
        }
    }
}

impl fmt::Display for KeyPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid btree id {id}")]
    InvalidBtreeId { id: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_increments_offset() {
        let p = KeyPos::new(3, 7);
        assert_eq!(p.successor(), KeyPos::new(3, 8));
    }

    #[test]
    fn successor_carries_into_inode() {
        let p = KeyPos::new(3, u64::MAX);
        assert_eq!(p.successor(), KeyPos::new(4, 0));
    }

    #[test]
    #[should_panic(expected = "successor of POS_MAX")]
    fn successor_of_pos_max_panics() {
        let _ = POS_MAX.successor();
    }

    #[test]
    fn pos_ordering_is_lexicographic() {
        assert!(KeyPos::new(1, u64::MAX) < KeyPos::new(2, 0));
        assert!(POS_MIN < KeyPos::new(0, 1));
        assert!(KeyPos::new(5, 5) < POS_MAX);
    }

    #[test]
    fn btree_id_round_trips_through_index() {
        for id in BtreeId::ALL {
            let idx = u8::try_from(id.index()).unwrap();
            assert_eq!(BtreeId::from_index(idx).unwrap(), id);
        }
        assert!(BtreeId::from_index(200).is_err());
    }
}
