//! Property tests over the split path and the format planner.

mod common;

use common::*;
use proptest::prelude::*;
use sfs_btree::node::NodeData;
use sfs_btree::{format, topology, Path};
use sfs_key::{KeyEntry, KeyVal};
use sfs_types::{KeyPos, Level, NodeSeq, POS_MIN};

fn arb_keys() -> impl Strategy<Value = Vec<(u64, u64, usize)>> {
    // (inode, offset, payload u64s); deduplicated by position later.
    proptest::collection::vec((0_u64..64, 0_u64..1024, 1_usize..24), 1..40)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// However a leaf is filled, splitting it preserves the key set and
    /// every interior span invariant.
    #[test]
    fn split_preserves_keys_and_spans(raw in arb_keys()) {
        let (fs, _device, cx) = mount_small();
        mkfs(&fs, &cx);

        let mut expected: Vec<KeyPos> = Vec::new();
        {
            let mut path = Path::traverse(&fs, &cx, TEST_BTREE, POS_MIN, Level(0)).unwrap();
            let leaf = path.node(Level(0)).unwrap();

            let mut used = 0_usize;
            for (inode, offset, payload) in raw {
                let pos = KeyPos::new(inode, offset);
                if expected.contains(&pos) {
                    continue;
                }
                // Keep the unsplit leaf comfortably inside one node.
                if used + 3 + payload > 200 {
                    break;
                }
                used += 3 + payload;
                expected.push(pos);
                leaf_insert(&leaf, pos, payload);
            }
            prop_assume!(!expected.is_empty());
            expected.sort();

            topology::split_leaf(&fs, &cx, &mut path, 0).unwrap();
        }
        fs.flush_interior_updates();

        verify(&fs, &cx);
        prop_assert_eq!(live_leaf_positions(&fs, &cx), expected);

        prop_assert_eq!(sfs_btree::interior::updates_nr_pending(&fs), 0);
        prop_assert_eq!(fs.journal.oldest_pinned(), None);
        fs.unmount();
    }

    /// The planner's chosen replacement format always fits, and packs
    /// every live key unless it fell back to the source format.
    #[test]
    fn replacement_format_always_fits(raw in arb_keys()) {
        let mut data = NodeData::empty(NodeSeq(1));
        let mut used = 0_usize;
        for (inode, offset, payload) in raw {
            if used + 3 + payload > 200 {
                break;
            }
            used += 3 + payload;
            data.insert_key(KeyEntry {
                pos: KeyPos::new(inode, offset),
                val: KeyVal::Opaque(vec![0; payload]),
            });
        }
        let nr = data.compute_nr();

        let node_sectors = 4;
        let chosen = format::replacement_format(node_sectors, &data, &nr);
        prop_assert!(
            format::format_fits(node_sectors, &nr, &data.format, &chosen)
                || chosen == data.format
        );
        if chosen != data.format {
            for e in data.live_entries() {
                prop_assert!(chosen.can_pack(e.key.pos));
            }
        }
    }
}
