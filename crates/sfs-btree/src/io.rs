//! Physical node reads and writes.
//!
//! The write path is where the reachability protocol bites: a node's
//! first write places its data, but while `will_make_reachable` points
//! at a pending update, later write attempts flush nothing. Writes are
//! also deferred while any update sits in the node's `write_blocked`
//! queue, and become no-ops in journal error state. A filesystem-wide
//! hold gate queues writes for tests that need to order completions.

use crate::format::NODE_HDR_BYTES;
use crate::fs::Fs;
use crate::interior;
use crate::node::{Node, NodeData, NodeState};
use asupersync::Cx;
use sfs_error::{Result, StoreError};
use sfs_key::{decode_key, encode_key, KeyEntry, KeyFormat};
use sfs_types::{BtreeId, JournalSeq, KeyPos, Level, NodeSeq, SectorCount, UpdateId};
use std::sync::Arc;
use tracing::{debug, trace, warn};

const NODE_MAGIC: u64 = 0x7364_666e_6f64_6531; // "sdfnode1"

/// Serialize a node image: 16-word header followed by encoded entries.
#[must_use]
pub fn serialize_node(state: &NodeState) -> Vec<u8> {
    let mut payload: Vec<u64> = Vec::new();
    for e in &state.data.entries {
        encode_key(&e.key, &state.data.format, &mut payload);
    }

    let mut payload_bytes = Vec::with_capacity(payload.len() * 8);
    for w in &payload {
        payload_bytes.extend_from_slice(&w.to_le_bytes());
    }
    let crc = crc32c::crc32c(&payload_bytes);

    let f = &state.data.format;
    let header: [u64; 16] = [
        NODE_MAGIC,
        u64::from(state.btree_id.index() as u8) | (u64::from(state.level.0) << 8),
        state.data.seq.0,
        state.data.journal_seq.0,
        state.data.min_key.inode,
        state.data.min_key.offset,
        state.data.max_key.inode,
        state.data.max_key.offset,
        f.field_offset[0],
        f.field_offset[1],
        u64::from(f.bits[0]) | (u64::from(f.bits[1]) << 8) | (u64::from(f.key_u64s) << 16),
        payload.len() as u64,
        u64::from(crc),
        0,
        0,
        0,
    ];

    let mut out = Vec::with_capacity(NODE_HDR_BYTES + payload_bytes.len());
    for w in header {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out.extend_from_slice(&payload_bytes);
    out
}

/// Parse a node image produced by [`serialize_node`].
pub fn deserialize_node(bytes: &[u8]) -> Result<(BtreeId, Level, NodeData)> {
    let corrupt = |detail: String| StoreError::Corruption {
        location: "node image".to_owned(),
        detail,
    };
    if bytes.len() < NODE_HDR_BYTES {
        return Err(corrupt("short node image".into()));
    }
    let word = |i: usize| {
        let mut buf = [0_u8; 8];
        buf.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
        u64::from_le_bytes(buf)
    };
    if word(0) != NODE_MAGIC {
        return Err(corrupt(format!("bad magic {:#x}", word(0))));
    }
    let btree_id = BtreeId::from_index(u8::try_from(word(1) & 0xff).expect("masked"))
        .map_err(|e| corrupt(e.to_string()))?;
    let level = Level(u8::try_from((word(1) >> 8) & 0xff).expect("masked"));

    let fw = word(10);
    let format = KeyFormat {
        field_offset: [word(8), word(9)],
        bits: [
            u8::try_from(fw & 0xff).expect("masked"),
            u8::try_from((fw >> 8) & 0xff).expect("masked"),
        ],
        key_u64s: u8::try_from((fw >> 16) & 0xff).expect("masked"),
    };

    let payload_u64s = usize::try_from(word(11)).expect("u64 fits usize");
    let payload_bytes = &bytes[NODE_HDR_BYTES..];
    if payload_bytes.len() < payload_u64s * 8 {
        return Err(corrupt("payload overruns image".into()));
    }
    let payload_bytes = &payload_bytes[..payload_u64s * 8];
    let crc = crc32c::crc32c(payload_bytes);
    if u64::from(crc) != word(12) {
        return Err(corrupt(format!("crc mismatch {:#x} != {:#x}", crc, word(12))));
    }

    let mut payload = Vec::with_capacity(payload_u64s);
    for chunk in payload_bytes.chunks_exact(8) {
        let mut buf = [0_u8; 8];
        buf.copy_from_slice(chunk);
        payload.push(u64::from_le_bytes(buf));
    }

    let mut data = NodeData {
        min_key: KeyPos {
            inode: word(4),
            offset: word(5),
        },
        max_key: KeyPos {
            inode: word(6),
            offset: word(7),
        },
        format,
        seq: NodeSeq(word(2)),
        journal_seq: JournalSeq(word(3)),
        entries: Vec::new(),
    };
    let mut off = 0;
    while off < payload.len() {
        let (key, used) = decode_key(&payload[off..], &format)?;
        data.entries.push(crate::node::Entry::new(key, &format));
        off += used;
    }
    Ok((btree_id, level, data))
}

/// Write `b` if it needs writing, subject to all deferral rules.
/// Never blocks; an actual device failure poisons the journal.
pub fn node_write(fs: &Fs, cx: &Cx, b: &Arc<Node>) {
    let mut completed: Option<Option<UpdateId>> = None;

    {
        let mut s = b.state();
        if !s.flags.need_write {
            return;
        }
        if s.flags.dying || s.flags.fake {
            s.flags.need_write = false;
            return;
        }
        if !s.write_blocked.is_empty() {
            // Blocked on dependent updates; the finalizer rewrites us.
            trace!(
                target: "sfs::btree::io",
                event = "write_deferred_blocked",
                node = %s.data.max_key
            );
            return;
        }
        if s.will_make_reachable.is_some() && s.flags.written {
            // Data already placed; nothing more until reachable.
            trace!(
                target: "sfs::btree::io",
                event = "write_suppressed_unreachable",
                node = %s.data.max_key
            );
            return;
        }

        if fs.journal.error() {
            // Shed the write so shutdown can proceed; recovery will see
            // the tree as it was.
            warn!(
                target: "sfs::btree::io",
                event = "write_shed_journal_error",
                node = %s.data.max_key
            );
            s.flags.need_write = false;
            s.flags.dirty = false;
            s.flags.write_in_flight = false;
            s.writes.swap();
            completed = Some(wmr_ref_to_put(&mut s));
        } else if fs.writes_held() {
            if !s.flags.write_in_flight {
                s.flags.write_in_flight = true;
                drop(s);
                fs.queue_held_write(b);
            }
            return;
        } else {
            let image = serialize_node(&s);
            assert!(
                image.len() <= fs.opts.btree_node_sectors as usize * sfs_block::SECTOR_BYTES,
                "node image overflows its extent"
            );
            let ptrs: Vec<_> = s
                .key
                .as_btree_ptr()
                .expect("writing a node with no pointer key")
                .ptrs()
                .to_vec();

            let mut failed = false;
            for p in &ptrs {
                if let Err(err) = fs.device.write_extent(cx, p.dev, p.addr, &image) {
                    warn!(
                        target: "sfs::btree::io",
                        event = "node_write_failed",
                        dev = p.dev.0,
                        sector = p.addr.0,
                        error = %err
                    );
                    failed = true;
                }
            }

            s.flags.need_write = false;
            s.flags.dirty = false;
            s.flags.write_in_flight = false;
            s.writes.swap();
            if failed {
                fs.journal.set_error();
            } else {
                s.flags.written = true;
                let sectors = SectorCount(fs.opts.btree_node_sectors);
                if let sfs_key::KeyVal::Ptr(ptr) = &mut s.key.val {
                    ptr.set_sectors_written(sectors);
                }
                debug!(
                    target: "sfs::btree::io",
                    event = "node_write",
                    level = s.level.0,
                    max_key = %s.data.max_key,
                    bytes = image.len()
                );
            }
            completed = Some(wmr_ref_to_put(&mut s));
        }
    }

    if let Some(put) = completed {
        complete_write(fs, b, put);
    }
}

/// Clear the barrier-reference bit, returning the update to notify.
fn wmr_ref_to_put(s: &mut NodeState) -> Option<UpdateId> {
    match s.will_make_reachable {
        Some(wmr) if wmr.ref_held => {
            s.will_make_reachable = Some(crate::node::WillMakeReachable {
                update: wmr.update,
                ref_held: false,
            });
            Some(wmr.update)
        }
        _ => None,
    }
}

/// Completion half of a node write: drop the journal pin the flushed
/// data held, then release the node's reference on its publishing
/// update's completion barrier.
fn complete_write(fs: &Fs, b: &Arc<Node>, put: Option<UpdateId>) {
    {
        let mut s = b.state();
        let pin = s.writes.prev_mut();
        if pin.is_active() {
            fs.journal.pin_drop(pin);
        }
    }
    if let Some(update) = put {
        interior::update_barrier_put(fs, update);
    }
}

/// Re-attempt writes that were queued while the hold gate was closed.
pub fn release_held_writes(fs: &Fs, cx: &Cx) {
    let pending = fs.take_held_writes();
    for b in pending {
        b.state().flags.write_in_flight = false;
        node_write(fs, cx, &b);
    }
}

/// Read a node image from any healthy replica of `key`.
pub fn node_read_data(fs: &Fs, cx: &Cx, key: &KeyEntry) -> Result<(BtreeId, Level, NodeData)> {
    let ptr = key.as_btree_ptr().ok_or_else(|| StoreError::Corruption {
        location: format!("key {}", key.pos),
        detail: "node read through a key with no pointers".to_owned(),
    })?;
    let len = fs.opts.btree_node_sectors as usize * sfs_block::SECTOR_BYTES;
    let mut last_err = None;
    for p in ptr.ptrs() {
        let mut buf = vec![0_u8; len];
        match fs
            .device
            .read_extent(cx, p.dev, p.addr, &mut buf)
            .and_then(|()| deserialize_node(&buf))
        {
            Ok(parsed) => return Ok(parsed),
            Err(err) => {
                warn!(
                    target: "sfs::btree::io",
                    event = "replica_read_failed",
                    dev = p.dev.0,
                    sector = p.addr.0,
                    error = %err
                );
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| StoreError::Corruption {
        location: format!("key {}", key.pos),
        detail: "pointer key with no replicas".to_owned(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Entry;
    use sfs_key::{BtreePtr, ExtentPtr, FormatState, KeyVal};
    use sfs_types::{DeviceIdx, SectorAddr};

    fn sample_data() -> NodeData {
        let mut s = FormatState::new();
        s.add_pos(KeyPos::new(1, 0));
        s.add_pos(KeyPos::new(1, 500));
        let format = s.done();

        let mut data = NodeData {
            min_key: KeyPos::new(1, 0),
            max_key: KeyPos::new(1, 500),
            format,
            seq: NodeSeq(3),
            journal_seq: JournalSeq(11),
            entries: Vec::new(),
        };
        for off in [5_u64, 50, 400] {
            data.entries.push(Entry::new(
                KeyEntry {
                    pos: KeyPos::new(1, off),
                    val: KeyVal::Opaque(vec![off, off * 2]),
                },
                &format,
            ));
        }
        data.entries.push(Entry::new(
            KeyEntry::ptr(
                KeyPos::new(1, 500),
                BtreePtr::V1 {
                    ptrs: vec![ExtentPtr {
                        dev: DeviceIdx(0),
                        addr: SectorAddr(256),
                    }],
                },
            ),
            &format,
        ));
        data
    }

    #[test]
    fn serialize_round_trips() {
        let data = sample_data();
        let node = Node::new(
            BtreeId::Dirents,
            Level(1),
            KeyEntry::whiteout(KeyPos::new(1, 500)),
            data.clone(),
        );
        let image = serialize_node(&node.state());
        let (id, level, parsed) = deserialize_node(&image).unwrap();

        assert_eq!(id, BtreeId::Dirents);
        assert_eq!(level, Level(1));
        assert_eq!(parsed.min_key, data.min_key);
        assert_eq!(parsed.max_key, data.max_key);
        assert_eq!(parsed.seq, data.seq);
        assert_eq!(parsed.journal_seq, data.journal_seq);
        assert_eq!(parsed.entries, data.entries);
    }

    #[test]
    fn deserialize_rejects_corruption() {
        let node = Node::new(
            BtreeId::Extents,
            Level(0),
            KeyEntry::whiteout(KeyPos::new(0, 0)),
            sample_data(),
        );
        let mut image = serialize_node(&node.state());

        // Flip a payload byte: crc must catch it.
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        assert!(deserialize_node(&image).is_err());

        // Bad magic.
        let mut bad_magic = serialize_node(&node.state());
        bad_magic[0] ^= 0xFF;
        assert!(deserialize_node(&bad_magic).is_err());
    }

    #[test]
    fn rewrite_to_original_format_is_byte_identical() {
        // Keys only; location metadata lives in the pointer key, not the
        // serialized bset.
        let data = sample_data();
        let ideal = crate::format::calc_format(&data);

        // Repack into the ideal format, then back into the original.
        let mut repacked = NodeData {
            min_key: data.min_key,
            max_key: data.max_key,
            format: ideal,
            seq: data.seq,
            journal_seq: data.journal_seq,
            entries: Vec::new(),
        };
        repacked.sort_in(&data);

        let mut back = NodeData {
            format: data.format,
            entries: Vec::new(),
            ..repacked.clone()
        };
        back.sort_in(&repacked);

        let n1 = Node::new(
            BtreeId::Extents,
            Level(0),
            KeyEntry::whiteout(KeyPos::new(0, 0)),
            data,
        );
        let n2 = Node::new(
            BtreeId::Extents,
            Level(0),
            KeyEntry::whiteout(KeyPos::new(0, 0)),
            back,
        );
        assert_eq!(serialize_node(&n1.state()), serialize_node(&n2.state()));
    }
}
