//! Format planning for node rewrites.
//!
//! When a node is rewritten, its replacement gets the narrowest packed
//! format its live keys fit in. Repacking can *grow* keys that were
//! stored unpacked relative to a narrower old format, so the planner
//! falls back to the source format if the repacked node would overflow.

use crate::node::{NodeData, NodeNr};
use sfs_key::{FormatState, KeyFormat, KEY_U64S_FULL};

/// Serialized node header size in bytes (see `io`).
pub const NODE_HDR_BYTES: usize = 16 * 8;

/// Usable key bytes in a node of `node_sectors`.
#[must_use]
pub fn btree_bytes(node_sectors: u32) -> usize {
    (node_sectors as usize) * sfs_block::SECTOR_BYTES - NODE_HDR_BYTES
}

/// Max key u64s a node can hold.
#[must_use]
pub fn btree_max_u64s(node_sectors: u32) -> usize {
    btree_bytes(node_sectors) / 8
}

/// The ideal (narrowest) format for `data`'s live keys plus `min_key`.
#[must_use]
pub fn calc_format(data: &NodeData) -> KeyFormat {
    let mut s = FormatState::new();
    s.add_pos(data.min_key);
    for e in data.live_entries() {
        s.add_pos(e.key.pos);
    }
    s.done()
}

/// Size of the node's live keys repacked under `new`: keys currently
/// packed change by the format-width delta, keys stored unpacked shrink
/// from full width (assuming they pack, which `calc_format` guarantees
/// for formats derived from this node).
#[must_use]
pub fn u64s_with_format(nr: &NodeNr, old: &KeyFormat, new: &KeyFormat) -> usize {
    let delta = (isize::from(new.key_u64s) - isize::from(old.key_u64s))
        * isize::try_from(nr.packed_keys).expect("key count fits isize")
        + (isize::from(new.key_u64s) - isize::from(KEY_U64S_FULL))
            * isize::try_from(nr.unpacked_keys).expect("key count fits isize");

    let total = isize::try_from(nr.live_u64s).expect("live u64s fits isize") + delta;
    assert!(total >= 0, "format delta underflows live u64s");
    usize::try_from(total).expect("checked non-negative")
}

/// Could the node be rewritten with `new` and still fit?
#[must_use]
pub fn format_fits(node_sectors: u32, nr: &NodeNr, old: &KeyFormat, new: &KeyFormat) -> bool {
    u64s_with_format(nr, old, new) * 8 < btree_bytes(node_sectors)
}

/// The format a replacement for this node should use: the ideal format,
/// unless repacking would overflow the node, in which case the source
/// format is kept.
#[must_use]
pub fn replacement_format(node_sectors: u32, data: &NodeData, nr: &NodeNr) -> KeyFormat {
    let new = calc_format(data);
    if format_fits(node_sectors, nr, &data.format, &new) {
        new
    } else {
        data.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_key::{KeyEntry, KeyVal};
    use sfs_types::{KeyPos, NodeSeq};

    fn opaque(pos: KeyPos, payload_u64s: usize) -> KeyEntry {
        KeyEntry {
            pos,
            val: KeyVal::Opaque(vec![0; payload_u64s]),
        }
    }

    #[test]
    fn ideal_format_shrinks_clustered_keys() {
        let mut d = NodeData::empty(NodeSeq(1));
        d.min_key = KeyPos::new(7, 0);
        d.max_key = KeyPos::new(7, 1000);
        for off in 0..10 {
            d.insert_key(opaque(KeyPos::new(7, off * 10), 1));
        }
        let f = calc_format(&d);
        assert!(f.key_u64s < KEY_U64S_FULL);

        let nr = d.compute_nr();
        let repacked = u64s_with_format(&nr, &d.format, &f);
        assert!(repacked < nr.live_u64s);
    }

    #[test]
    fn whiteouts_do_not_widen_the_format() {
        let mut d = NodeData::empty(NodeSeq(1));
        d.min_key = KeyPos::new(7, 0);
        d.insert_key(opaque(KeyPos::new(7, 5), 1));
        d.insert_key(KeyEntry::whiteout(KeyPos::new(900, 0)));

        let f = calc_format(&d);
        assert!(!f.can_pack(KeyPos::new(900, 0)));
    }

    #[test]
    fn replacement_falls_back_when_repack_overflows() {
        // Node with 4 sectors: 2048 - 128 header = 1920 bytes = 240 u64s.
        let node_sectors = 4;
        assert_eq!(btree_max_u64s(node_sectors), 240);

        let mut d = NodeData::empty(NodeSeq(1));
        d.min_key = sfs_types::POS_MIN;
        // Current format: inode pinned to 0, offset packed in 40 bits;
        // keys take 2 u64s packed.
        let mut s = FormatState::new();
        s.add_pos(KeyPos::new(0, 0));
        s.add_pos(KeyPos::new(0, (1 << 40) - 1));
        d.format = s.done();
        assert_eq!(d.format.key_u64s, 2);

        // 117 packed keys (234 u64s) plus one outlier whose position
        // needs a 64-bit offset field *and* an inode bit, pushing the
        // ideal format to 3 u64s per key.
        for k in 0..117 {
            d.insert_key(opaque(KeyPos::new(0, k), 0));
        }
        d.insert_key(opaque(KeyPos::new(1, 1 << 63), 0));

        let nr = d.compute_nr();
        assert_eq!(nr.live_u64s, 117 * 2 + 3);
        assert_eq!(nr.packed_keys, 117);
        assert_eq!(nr.unpacked_keys, 1);

        let ideal = calc_format(&d);
        assert_eq!(ideal.key_u64s, 3);
        // Repacking grows every packed key by one u64: 354 > 240.
        assert_eq!(u64s_with_format(&nr, &d.format, &ideal), 354);
        assert!(!format_fits(node_sectors, &nr, &d.format, &ideal));

        assert_eq!(replacement_format(node_sectors, &d, &nr), d.format);
    }
}
