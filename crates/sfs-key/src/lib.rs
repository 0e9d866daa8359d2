#![forbid(unsafe_code)]
//! Node-pointer keys and the packed-key format machinery.
//!
//! A btree node is identified on disk by its *pointer key*: the node's
//! `max_key` position paired with a [`BtreePtr`] value naming its replica
//! locations. Two pointer variants exist; `V2` additionally carries
//! `min_key`, the node data seq, and sector bookkeeping, and is used when
//! the filesystem advertises the feature.
//!
//! Packed formats store key positions relative to per-field base offsets
//! in the minimum number of bits; [`FormatState`] unions the width
//! requirements of a set of keys into a [`KeyFormat`].

use serde::{Deserialize, Serialize};
use sfs_error::{Result, StoreError};
use sfs_types::{DeviceIdx, KeyPos, NodeSeq, SectorAddr, SectorCount};
use std::hash::{Hash, Hasher};

/// u64s occupied by an unpacked key: header word + inode + offset.
pub const KEY_U64S_FULL: u8 = 3;

/// Packed position fields, in encoding order.
const NR_FIELDS: usize = 2;

/// One replica location: device plus starting sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentPtr {
    pub dev: DeviceIdx,
    pub addr: SectorAddr,
}

impl ExtentPtr {
    fn encode(self) -> u64 {
        (u64::from(self.dev.0) << 56) | (self.addr.0 & ((1 << 56) - 1))
    }

    fn decode(word: u64) -> ExtentPtr {
        ExtentPtr {
            dev: DeviceIdx(u8::try_from(word >> 56).unwrap_or(0)),
            addr: SectorAddr(word & ((1 << 56) - 1)),
        }
    }
}

/// The on-disk pointer value of a btree node key.
///
/// Every callsite handling a pointer must match both variants; `V2` is
/// preferred at allocation time when the format feature is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BtreePtr {
    V1 {
        ptrs: Vec<ExtentPtr>,
    },
    V2 {
        ptrs: Vec<ExtentPtr>,
        min_key: KeyPos,
        seq: NodeSeq,
        sectors_written: SectorCount,
        sectors: SectorCount,
    },
}

impl BtreePtr {
    #[must_use]
    pub fn ptrs(&self) -> &[ExtentPtr] {
        match self {
            BtreePtr::V1 { ptrs } | BtreePtr::V2 { ptrs, .. } => ptrs,
        }
    }

    #[must_use]
    pub fn ptrs_mut(&mut self) -> &mut Vec<ExtentPtr> {
        match self {
            BtreePtr::V1 { ptrs } | BtreePtr::V2 { ptrs, .. } => ptrs,
        }
    }

    /// `min_key` is only recorded by the v2 variant.
    #[must_use]
    pub fn min_key(&self) -> Option<KeyPos> {
        match self {
            BtreePtr::V1 { .. } => None,
            BtreePtr::V2 { min_key, .. } => Some(*min_key),
        }
    }

    pub fn set_min_key(&mut self, pos: KeyPos) {
        if let BtreePtr::V2 { min_key, .. } = self {
            *min_key = pos;
        }
    }

    pub fn set_sectors_written(&mut self, written: SectorCount) {
        if let BtreePtr::V2 {
            sectors_written, ..
        } = self
        {
            *sectors_written = written;
        }
    }

    /// Encoded value size in u64s.
    #[must_use]
    pub fn val_u64s(&self) -> usize {
        match self {
            BtreePtr::V1 { ptrs } => ptrs.len(),
            BtreePtr::V2 { ptrs, .. } => 4 + ptrs.len(),
        }
    }

    /// Hash of the physical locations; the node cache indexes by this, so
    /// two keys with the same replica set hash identically regardless of
    /// variant or metadata.
    #[must_use]
    pub fn hash_val(&self) -> u64 {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.ptrs().hash(&mut h);
        h.finish()
    }
}

/// What a stored key carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyVal {
    /// Interior entry: pointer to a child node.
    Ptr(BtreePtr),
    /// Leaf payload, opaque to the interior engine.
    Opaque(Vec<u64>),
    /// Deleted key (whiteout). Carries no value.
    Whiteout,
}

impl KeyVal {
    #[must_use]
    pub fn val_u64s(&self) -> usize {
        match self {
            KeyVal::Ptr(p) => p.val_u64s(),
            KeyVal::Opaque(words) => words.len(),
            KeyVal::Whiteout => 0,
        }
    }

    #[must_use]
    pub fn is_whiteout(&self) -> bool {
        matches!(self, KeyVal::Whiteout)
    }
}

/// A full key: position plus value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub pos: KeyPos,
    pub val: KeyVal,
}

impl KeyEntry {
    #[must_use]
    pub fn ptr(pos: KeyPos, ptr: BtreePtr) -> KeyEntry {
        KeyEntry {
            pos,
            val: KeyVal::Ptr(ptr),
        }
    }

    /// A delete for `pos`: replaces whatever key covered that position.
    #[must_use]
    pub fn whiteout(pos: KeyPos) -> KeyEntry {
        KeyEntry {
            pos,
            val: KeyVal::Whiteout,
        }
    }

    /// u64s this key occupies unpacked (header + full position + value).
    #[must_use]
    pub fn u64s(&self) -> usize {
        usize::from(KEY_U64S_FULL) + self.val.val_u64s()
    }

    #[must_use]
    pub fn as_btree_ptr(&self) -> Option<&BtreePtr> {
        match &self.val {
            KeyVal::Ptr(p) => Some(p),
            _ => None,
        }
    }
}

// ── Packed formats ──────────────────────────────────────────────────────────

/// A packed-key format: per-field base offsets and bit widths.
///
/// A position packs under a format iff every field is `>=` the base and
/// the delta fits in the field's width. `key_u64s` counts the header word
/// plus the packed field words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFormat {
    pub field_offset: [u64; NR_FIELDS],
    pub bits: [u8; NR_FIELDS],
    pub key_u64s: u8,
}

impl KeyFormat {
    /// The degenerate format that packs nothing: full-width fields.
    pub const FULL: KeyFormat = KeyFormat {
        field_offset: [0, 0],
        bits: [64, 64],
        key_u64s: KEY_U64S_FULL,
    };

    fn fields(pos: KeyPos) -> [u64; NR_FIELDS] {
        [pos.inode, pos.offset]
    }

    #[must_use]
    pub fn can_pack(&self, pos: KeyPos) -> bool {
        let fields = Self::fields(pos);
        for i in 0..NR_FIELDS {
            let Some(delta) = fields[i].checked_sub(self.field_offset[i]) else {
                return false;
            };
            if self.bits[i] < 64 && delta >> self.bits[i] != 0 {
                return false;
            }
        }
        true
    }

    /// Pack `pos` into field words (excluding the header word), or `None`
    /// if it does not fit.
    #[must_use]
    pub fn pack(&self, pos: KeyPos) -> Option<Vec<u64>> {
        if !self.can_pack(pos) {
            return None;
        }
        let fields = Self::fields(pos);
        let mut words = vec![0_u64; usize::from(self.key_u64s) - 1];
        let mut bit = 0_usize;
        for i in 0..NR_FIELDS {
            let delta = fields[i] - self.field_offset[i];
            let width = usize::from(self.bits[i]);
            put_bits(&mut words, bit, width, delta);
            bit += width;
        }
        Some(words)
    }

    /// Decode field words produced by [`KeyFormat::pack`].
    pub fn unpack(&self, words: &[u64]) -> Result<KeyPos> {
        if words.len() + 1 != usize::from(self.key_u64s) {
            return Err(StoreError::Corruption {
                location: "packed key".to_owned(),
                detail: format!(
                    "expected {} field words, got {}",
                    self.key_u64s - 1,
                    words.len()
                ),
            });
        }
        let mut fields = [0_u64; NR_FIELDS];
        let mut bit = 0_usize;
        for i in 0..NR_FIELDS {
            let width = usize::from(self.bits[i]);
            let delta = get_bits(words, bit, width);
            fields[i] = self.field_offset[i].wrapping_add(delta);
            bit += width;
        }
        Ok(KeyPos {
            inode: fields[0],
            offset: fields[1],
        })
    }
}

fn put_bits(words: &mut [u64], start: usize, width: usize, value: u64) {
    if width == 0 {
        return;
    }
    let word = start / 64;
    let shift = start % 64;
    words[word] |= value << shift;
    if shift + width > 64 && shift != 0 {
        words[word + 1] |= value >> (64 - shift);
    }
}

fn get_bits(words: &[u64], start: usize, width: usize) -> u64 {
    if width == 0 {
        return 0;
    }
    let word = start / 64;
    let shift = start % 64;
    let mut value = words[word] >> shift;
    if shift + width > 64 && shift != 0 {
        value |= words[word + 1] << (64 - shift);
    }
    if width < 64 {
        value &= (1 << width) - 1;
    }
    value
}

/// Accumulates field-width requirements over a set of keys.
#[derive(Debug, Clone)]
pub struct FormatState {
    field_min: [u64; NR_FIELDS],
    field_max: [u64; NR_FIELDS],
    empty: bool,
}

impl Default for FormatState {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatState {
    #[must_use]
    pub fn new() -> FormatState {
        FormatState {
            field_min: [u64::MAX; NR_FIELDS],
            field_max: [0; NR_FIELDS],
            empty: true,
        }
    }

    pub fn add_pos(&mut self, pos: KeyPos) {
        let fields = KeyFormat::fields(pos);
        for i in 0..NR_FIELDS {
            self.field_min[i] = self.field_min[i].min(fields[i]);
            self.field_max[i] = self.field_max[i].max(fields[i]);
        }
        self.empty = false;
    }

    /// Finish the union into a concrete format.
    #[must_use]
    pub fn done(self) -> KeyFormat {
        if self.empty {
            return KeyFormat::FULL;
        }
        let mut bits = [0_u8; NR_FIELDS];
        let mut total_bits = 0_u32;
        for i in 0..NR_FIELDS {
            let range = self.field_max[i] - self.field_min[i];
            let width = 64 - range.leading_zeros();
            bits[i] = u8::try_from(width).unwrap_or(64);
            total_bits += width;
        }
        let key_u64s = 1 + total_bits.div_ceil(64);
        KeyFormat {
            field_offset: self.field_min,
            bits,
            key_u64s: u8::try_from(key_u64s).unwrap_or(KEY_U64S_FULL),
        }
    }
}

// ── Keylists ────────────────────────────────────────────────────────────────

/// An ordered scratch list of keys, consumed front to back.
///
/// Interior updates use keylists for the pointer deltas they will journal
/// and for the keys they will insert into a parent node.
#[derive(Debug, Clone, Default)]
pub struct Keylist {
    keys: std::collections::VecDeque<KeyEntry>,
}

impl Keylist {
    #[must_use]
    pub fn new() -> Keylist {
        Keylist::default()
    }

    pub fn push(&mut self, key: KeyEntry) {
        self.keys.push_back(key);
    }

    #[must_use]
    pub fn front(&self) -> Option<&KeyEntry> {
        self.keys.front()
    }

    pub fn pop_front(&mut self) -> Option<KeyEntry> {
        self.keys.pop_front()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Total unpacked size of the listed keys.
    #[must_use]
    pub fn u64s(&self) -> usize {
        self.keys.iter().map(KeyEntry::u64s).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyEntry> {
        self.keys.iter()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    /// Panics if the keys are not in strictly ascending position order.
    pub fn verify_sorted(&self) {
        let mut prev: Option<KeyPos> = None;
        for k in &self.keys {
            if let Some(p) = prev {
                assert!(p <= k.pos, "keylist out of order: {p} > {}", k.pos);
            }
            prev = Some(k.pos);
        }
    }
}

impl<'a> IntoIterator for &'a Keylist {
    type Item = &'a KeyEntry;
    type IntoIter = std::collections::vec_deque::Iter<'a, KeyEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.iter()
    }
}

// ── Entry codec ─────────────────────────────────────────────────────────────

const TAG_WHITEOUT: u64 = 0;
const TAG_PTR_V1: u64 = 1;
const TAG_PTR_V2: u64 = 2;
const TAG_OPAQUE: u64 = 3;

/// Append `key` to `out` as u64 words, packing the position under
/// `format` when it fits.
///
/// Header word layout: `u64s` in bits 0..16, value tag in bits 16..18,
/// packed flag in bit 18.
pub fn encode_key(key: &KeyEntry, format: &KeyFormat, out: &mut Vec<u64>) {
    let (pos_words, packed) = match format.pack(key.pos) {
        Some(words) if format.key_u64s < KEY_U64S_FULL => (words, true),
        _ => (vec![key.pos.inode, key.pos.offset], false),
    };

    let tag = match &key.val {
        KeyVal::Whiteout => TAG_WHITEOUT,
        KeyVal::Ptr(BtreePtr::V1 { .. }) => TAG_PTR_V1,
        KeyVal::Ptr(BtreePtr::V2 { .. }) => TAG_PTR_V2,
        KeyVal::Opaque(_) => TAG_OPAQUE,
    };

    let u64s = 1 + pos_words.len() + key.val.val_u64s();
    let header = u64s as u64 | (tag << 16) | (u64::from(packed) << 18);

    out.push(header);
    out.extend_from_slice(&pos_words);

    match &key.val {
        KeyVal::Whiteout => {}
        KeyVal::Ptr(BtreePtr::V1 { ptrs }) => {
            out.extend(ptrs.iter().map(|p| p.encode()));
        }
        KeyVal::Ptr(BtreePtr::V2 {
            ptrs,
            min_key,
            seq,
            sectors_written,
            sectors,
        }) => {
            out.push(min_key.inode);
            out.push(min_key.offset);
            out.push(seq.0);
            out.push((u64::from(sectors_written.0) << 32) | u64::from(sectors.0));
            out.extend(ptrs.iter().map(|p| p.encode()));
        }
        KeyVal::Opaque(words) => out.extend_from_slice(words),
    }
}

/// Decode one key starting at `words[0]`, returning it and the number of
/// words consumed.
pub fn decode_key(words: &[u64], format: &KeyFormat) -> Result<(KeyEntry, usize)> {
    let corrupt = |detail: String| StoreError::Corruption {
        location: "encoded key".to_owned(),
        detail,
    };

    let header = *words.first().ok_or_else(|| corrupt("empty input".into()))?;
    let u64s = usize::try_from(header & 0xffff).expect("u64 fits usize");
    let tag = (header >> 16) & 0x3;
    let packed = (header >> 18) & 1 != 0;

    if u64s == 0 || u64s > words.len() {
        return Err(corrupt(format!(
            "entry claims {u64s} u64s, {} available",
            words.len()
        )));
    }

    let pos_u64s = if packed {
        usize::from(format.key_u64s) - 1
    } else {
        2
    };
    if 1 + pos_u64s > u64s {
        return Err(corrupt("position overruns entry".into()));
    }

    let pos = if packed {
        format.unpack(&words[1..1 + pos_u64s])?
    } else {
        KeyPos {
            inode: words[1],
            offset: words[2],
        }
    };

    let val_words = &words[1 + pos_u64s..u64s];
    let val = match tag {
        TAG_WHITEOUT => KeyVal::Whiteout,
        TAG_PTR_V1 => KeyVal::Ptr(BtreePtr::V1 {
            ptrs: val_words.iter().map(|&w| ExtentPtr::decode(w)).collect(),
        }),
        TAG_PTR_V2 => {
            if val_words.len() < 4 {
                return Err(corrupt("v2 pointer too short".into()));
            }
            KeyVal::Ptr(BtreePtr::V2 {
                min_key: KeyPos {
                    inode: val_words[0],
                    offset: val_words[1],
                },
                seq: NodeSeq(val_words[2]),
                sectors_written: SectorCount(
                    u32::try_from(val_words[3] >> 32).expect("shifted u64 fits u32"),
                ),
                sectors: SectorCount(
                    u32::try_from(val_words[3] & 0xffff_ffff).expect("masked u64 fits u32"),
                ),
                ptrs: val_words[4..].iter().map(|&w| ExtentPtr::decode(w)).collect(),
            })
        }
        TAG_OPAQUE => KeyVal::Opaque(val_words.to_vec()),
        _ => unreachable!("2-bit tag"),
    };

    Ok((KeyEntry { pos, val }, u64s))
}
