//! Shared harness for the interior-update e2e tests.
#![allow(dead_code)] // not every test binary uses every helper

use asupersync::Cx;
use sfs_block::MemSectorDevice;
use sfs_btree::node::Node;
use sfs_btree::{fs::StoreOpts, root, topology, Fs, Path};
use sfs_key::{KeyEntry, KeyVal};
use sfs_types::{BtreeId, KeyPos, Level, ReplicaCount, POS_MIN};
use std::sync::Arc;

pub const TEST_BTREE: BtreeId = BtreeId::Extents;

/// Small nodes so splits trigger with a handful of keys:
/// 4 sectors = 2048 bytes, 240 key u64s, split threshold 160.
pub fn small_opts() -> StoreOpts {
    StoreOpts {
        btree_node_sectors: 4,
        metadata_replicas: ReplicaCount(1),
        ..StoreOpts::default()
    }
}

pub fn mount_small() -> (Arc<Fs>, Arc<MemSectorDevice>, Cx) {
    mount_with(small_opts())
}

pub fn mount_with(opts: StoreOpts) -> (Arc<Fs>, Arc<MemSectorDevice>, Cx) {
    let cx = Cx::for_testing();
    let device = Arc::new(MemSectorDevice::new(2));
    let fs = Fs::mount(opts, Arc::clone(&device) as Arc<dyn sfs_block::SectorDevice>)
        .expect("mount");
    (fs, device, cx)
}

/// mkfs: install a fake root, then rewrite it into a real (written,
/// journalled) empty leaf root.
pub fn mkfs(fs: &Fs, cx: &Cx) {
    root::root_alloc(fs, TEST_BTREE, cx).expect("root alloc");
    let mut path = Path::traverse(fs, cx, TEST_BTREE, POS_MIN, Level(0)).expect("traverse");
    let seq = path.node(Level(0)).expect("leaf").data_seq();
    topology::node_rewrite(fs, cx, &mut path, Level(0), seq, 0).expect("root rewrite");
    drop(path);
    fs.flush_interior_updates();
}

/// Drop a leaf key straight into the node (the leaf KV path proper is
/// outside the engine; tests feed leaves directly).
pub fn leaf_insert(b: &Arc<Node>, pos: KeyPos, payload_u64s: usize) {
    b.lock.lock_write();
    {
        let mut bs = b.state();
        bs.data.insert_key(KeyEntry {
            pos,
            val: KeyVal::Opaque(vec![pos.inode; payload_u64s]),
        });
        bs.nr = bs.data.compute_nr();
        bs.flags.dirty = true;
        bs.flags.need_write = true;
    }
    b.lock.unlock_write();
}

/// Positions of all live leaf keys reachable from the root, in order.
pub fn live_leaf_positions(fs: &Fs, cx: &Cx) -> Vec<KeyPos> {
    let root = root::read_tree(fs, cx, TEST_BTREE)
        .expect("read tree")
        .expect("root exists");
    let mut out = Vec::new();
    collect_leaf_positions(fs, cx, &root, &mut out);
    out
}

fn collect_leaf_positions(fs: &Fs, cx: &Cx, b: &Arc<Node>, out: &mut Vec<KeyPos>) {
    if b.level().is_leaf() {
        let bs = b.state();
        out.extend(bs.data.live_entries().map(|e| e.key.pos));
        return;
    }
    let children: Vec<KeyEntry> = {
        let bs = b.state();
        bs.data.live_entries().map(|e| e.key.clone()).collect()
    };
    for key in children {
        let child = sfs_btree::path::node_get(fs, cx, &key, Level(b.level().0 - 1))
            .expect("child readable");
        collect_leaf_positions(fs, cx, &child, out);
    }
}

/// Count nodes in the reachable tree.
pub fn count_tree_nodes(fs: &Fs, cx: &Cx) -> usize {
    let root = root::read_tree(fs, cx, TEST_BTREE)
        .expect("read tree")
        .expect("root exists");
    count_nodes(fs, cx, &root)
}

fn count_nodes(fs: &Fs, cx: &Cx, b: &Arc<Node>) -> usize {
    if b.level().is_leaf() {
        return 1;
    }
    let children: Vec<KeyEntry> = {
        let bs = b.state();
        bs.data.live_entries().map(|e| e.key.clone()).collect()
    };
    let mut n = 1;
    for key in children {
        let child = sfs_btree::path::node_get(fs, cx, &key, Level(b.level().0 - 1))
            .expect("child readable");
        n += count_nodes(fs, cx, &child);
    }
    n
}

/// Verify the whole tree's span invariants.
pub fn verify(fs: &Fs, cx: &Cx) {
    let root = root::read_tree(fs, cx, TEST_BTREE)
        .expect("read tree")
        .expect("root exists");
    root::verify_tree(fs, cx, &root).expect("tree verifies");
}
