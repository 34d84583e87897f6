//! Module `bucket` implement the B-tree page format.
//!
//! One bucket is one page. The header is followed by the slot array
//! growing forward; key bytes live at the top of the page growing
//! backward, each prefixed by a u16 length. The empty region sits in
//! between. Deleting or moving a slot leaves its key bytes stranded and
//! sets the not-packed flag; `repack` squeezes the key region back into
//! one piece.
//!
//! Slots are sorted by the composite comparator over `(key, record
//! locator)`. A slot's record locator is a tagged [RecRef]: the low bit
//! marks the slot unused -- logically deleted but still present so the
//! ordering of its neighbours is undisturbed.
//!
//! This module knows nothing about the tree; every function works on one
//! page's bytes. The tree engine in [super::tree] composes them.

use std::{cmp, convert::TryFrom};

use crate::{
    btree::key::{self, KeyOrder},
    loc::{DiskLoc, RecRef},
    Result,
};

/// Bytes reserved for the bucket header.
pub const BKT_HDR_SIZE: usize = 32;
/// Bytes per slot.
pub const SLOT_SIZE: usize = 18;
// u16 length prefix in front of each key's bytes.
const KEY_PFX: usize = 2;

// header flag: key region has holes.
const FLAG_NOT_PACKED: u16 = 0x1;

/// Largest key accepted into a bucket of `total` bytes: a quarter of the
/// page less per-slot overhead.
pub fn max_key_len(total: usize) -> usize {
    total / 4 - (SLOT_SIZE + KEY_PFX)
}

/// One decoded slot.
#[derive(Clone, Copy, Debug)]
pub struct Slot {
    pub left: DiskLoc,
    pub rec: RecRef,
    pub key_ofs: u16,
}

/// Initialize `buf` as an empty bucket.
pub fn init(buf: &mut [u8], parent: DiskLoc) {
    let total = u32::try_from(buf.len()).unwrap();
    for b in buf.iter_mut() {
        *b = 0;
    }
    buf[0..8].copy_from_slice(&parent.to_bytes());
    buf[8..16].copy_from_slice(&DiskLoc::NULL.to_bytes());
    buf[16..20].copy_from_slice(&total.to_le_bytes());
    set_top(buf, 0);
    set_n(buf, 0);
    set_flags(buf, 0);
    refresh_empty(buf);
}

pub fn parent(buf: &[u8]) -> DiskLoc {
    DiskLoc::from_bytes(&buf[0..8]).unwrap()
}

pub fn set_parent(buf: &mut [u8], loc: DiskLoc) {
    buf[0..8].copy_from_slice(&loc.to_bytes());
}

pub fn next_child(buf: &[u8]) -> DiskLoc {
    DiskLoc::from_bytes(&buf[8..16]).unwrap()
}

pub fn set_next_child(buf: &mut [u8], loc: DiskLoc) {
    buf[8..16].copy_from_slice(&loc.to_bytes());
}

pub fn total(buf: &[u8]) -> usize {
    use std::convert::TryInto;

    u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize
}

pub fn empty(buf: &[u8]) -> usize {
    use std::convert::TryInto;

    u32::from_le_bytes(buf[20..24].try_into().unwrap()) as usize
}

fn set_empty(buf: &mut [u8], val: usize) {
    buf[20..24].copy_from_slice(&u32::try_from(val).unwrap().to_le_bytes());
}

fn top(buf: &[u8]) -> usize {
    use std::convert::TryInto;

    u32::from_le_bytes(buf[24..28].try_into().unwrap()) as usize
}

fn set_top(buf: &mut [u8], val: usize) {
    buf[24..28].copy_from_slice(&u32::try_from(val).unwrap().to_le_bytes());
}

pub fn n(buf: &[u8]) -> usize {
    use std::convert::TryInto;

    u16::from_le_bytes(buf[28..30].try_into().unwrap()) as usize
}

fn set_n(buf: &mut [u8], val: usize) {
    buf[28..30].copy_from_slice(&u16::try_from(val).unwrap().to_le_bytes());
}

fn flags(buf: &[u8]) -> u16 {
    use std::convert::TryInto;

    u16::from_le_bytes(buf[30..32].try_into().unwrap())
}

fn set_flags(buf: &mut [u8], val: u16) {
    buf[30..32].copy_from_slice(&val.to_le_bytes());
}

fn refresh_empty(buf: &mut [u8]) {
    let used = BKT_HDR_SIZE + n(buf) * SLOT_SIZE + top(buf);
    let total = total(buf);
    set_empty(buf, total - used);
}

pub fn slot(buf: &[u8], i: usize) -> Slot {
    use std::convert::TryInto;

    debug_assert!(i < n(buf));
    let off = BKT_HDR_SIZE + i * SLOT_SIZE;
    Slot {
        left: DiskLoc::from_bytes(&buf[off..off + 8]).unwrap(),
        rec: RecRef::from_bytes(&buf[off + 8..off + 16]).unwrap(),
        key_ofs: u16::from_le_bytes(buf[off + 16..off + 18].try_into().unwrap()),
    }
}

fn store_slot(buf: &mut [u8], i: usize, slot: &Slot) {
    let off = BKT_HDR_SIZE + i * SLOT_SIZE;
    buf[off..off + 8].copy_from_slice(&slot.left.to_bytes());
    buf[off + 8..off + 16].copy_from_slice(&slot.rec.to_bytes());
    buf[off + 16..off + 18].copy_from_slice(&slot.key_ofs.to_le_bytes());
}

pub fn set_slot_left(buf: &mut [u8], i: usize, left: DiskLoc) {
    let mut s = slot(buf, i);
    s.left = left;
    store_slot(buf, i, &s);
}

pub fn set_slot_rec(buf: &mut [u8], i: usize, rec: RecRef) {
    let mut s = slot(buf, i);
    s.rec = rec;
    store_slot(buf, i, &s);
}

/// Key bytes of slot `i`.
pub fn slot_key<'a>(buf: &'a [u8], i: usize) -> &'a [u8] {
    use std::convert::TryInto;

    let ofs = slot(buf, i).key_ofs as usize;
    let len = u16::from_le_bytes(buf[ofs..ofs + KEY_PFX].try_into().unwrap()) as usize;
    &buf[ofs + KEY_PFX..ofs + KEY_PFX + len]
}

/// Child pointer for logical position `p`: slot `p`'s left child for
/// `p < n`, the next-child for `p == n`.
pub fn child_for_pos(buf: &[u8], p: usize) -> DiskLoc {
    if p < n(buf) {
        slot(buf, p).left
    } else {
        next_child(buf)
    }
}

pub fn set_child_for_pos(buf: &mut [u8], p: usize, loc: DiskLoc) {
    if p < n(buf) {
        set_slot_left(buf, p, loc);
    } else {
        set_next_child(buf, loc);
    }
}

/// A bucket is a leaf when every child pointer is null.
pub fn is_leaf(buf: &[u8]) -> bool {
    if !next_child(buf).is_null() {
        return false;
    }
    (0..n(buf)).all(|i| slot(buf, i).left.is_null())
}

/// Binary-search the slot array for `(key, loc)`. Returns the position the
/// pair occupies or would be inserted at, and whether it was found
/// exactly. Unused slots participate in the comparison.
pub fn search(
    buf: &[u8],
    key: &[u8],
    loc: u64,
    order: &KeyOrder,
) -> Result<(usize, bool)> {
    let (mut lo, mut hi) = (0, n(buf));
    while lo < hi {
        let mid = (lo + hi) / 2;
        let s = slot(buf, mid);
        let ord = match key::compare(slot_key(buf, mid), key, order)? {
            cmp::Ordering::Equal => s.rec.as_u64().cmp(&loc),
            ord => ord,
        };
        match ord {
            cmp::Ordering::Less => lo = mid + 1,
            cmp::Ordering::Greater => hi = mid,
            cmp::Ordering::Equal => return Ok((mid, true)),
        }
    }
    Ok((lo, false))
}

/// Insert `(key, rec)` at `pos` if the bucket has room, repacking a holey
/// key region first when that would make it fit. Returns false when the
/// bucket is full.
pub fn basic_insert(
    buf: &mut [u8],
    pos: usize,
    key: &[u8],
    rec: RecRef,
    left: DiskLoc,
) -> Result<bool> {
    let need = SLOT_SIZE + KEY_PFX + key.len();
    if empty(buf) < need {
        if flags(buf) & FLAG_NOT_PACKED != 0 && packed_would_fit(buf, need) {
            repack(buf)?;
        } else {
            return Ok(false);
        }
    }

    let count = n(buf);
    debug_assert!(pos <= count);

    // open a hole in the slot array.
    let start = BKT_HDR_SIZE + pos * SLOT_SIZE;
    let end = BKT_HDR_SIZE + count * SLOT_SIZE;
    buf.copy_within(start..end, start + SLOT_SIZE);

    // key bytes go below the current key region.
    let top = top(buf) + KEY_PFX + key.len();
    let key_ofs = total(buf) - top;
    buf[key_ofs..key_ofs + KEY_PFX]
        .copy_from_slice(&u16::try_from(key.len()).unwrap().to_le_bytes());
    buf[key_ofs + KEY_PFX..key_ofs + KEY_PFX + key.len()].copy_from_slice(key);
    set_top(buf, top);

    set_n(buf, count + 1);
    store_slot(
        buf,
        pos,
        &Slot { left, rec, key_ofs: u16::try_from(key_ofs).unwrap() },
    );
    refresh_empty(buf);
    Ok(true)
}

// would the insert fit once the key region is repacked?
fn packed_would_fit(buf: &[u8], need: usize) -> bool {
    let live: usize = (0..n(buf)).map(|i| KEY_PFX + slot_key(buf, i).len()).sum();
    let used = BKT_HDR_SIZE + n(buf) * SLOT_SIZE + live;
    total(buf) - used >= need
}

/// Rewrite the key region so the empty space is one contiguous region.
/// Clears the not-packed flag.
pub fn repack(buf: &mut [u8]) -> Result<()> {
    let count = n(buf);
    let keys: Vec<Vec<u8>> = (0..count).map(|i| slot_key(buf, i).to_vec()).collect();

    let mut top = 0;
    for (i, key) in keys.iter().enumerate() {
        top += KEY_PFX + key.len();
        let key_ofs = total(buf) - top;
        buf[key_ofs..key_ofs + KEY_PFX]
            .copy_from_slice(&u16::try_from(key.len()).unwrap().to_le_bytes());
        buf[key_ofs + KEY_PFX..key_ofs + KEY_PFX + key.len()].copy_from_slice(key);
        let mut s = slot(buf, i);
        s.key_ofs = u16::try_from(key_ofs).unwrap();
        store_slot(buf, i, &s);
    }
    set_top(buf, top);
    set_flags(buf, flags(buf) & !FLAG_NOT_PACKED);
    refresh_empty(buf);
    Ok(())
}

/// Remove slot `pos`, leaving its key bytes stranded. The not-packed flag
/// is raised; `repack` reclaims the bytes later.
pub fn del_slot(buf: &mut [u8], pos: usize) {
    let count = n(buf);
    debug_assert!(pos < count);
    let start = BKT_HDR_SIZE + (pos + 1) * SLOT_SIZE;
    let end = BKT_HDR_SIZE + count * SLOT_SIZE;
    buf.copy_within(start..end, start - SLOT_SIZE);
    set_n(buf, count - 1);
    set_flags(buf, flags(buf) | FLAG_NOT_PACKED);
    refresh_empty(buf);
}

/// Drop every unused slot. Returns how many went. Called before a bucket
/// is split, so tombstones do not force splits.
pub fn compact_unused(buf: &mut [u8]) -> usize {
    let mut dropped = 0;
    let mut i = 0;
    while i < n(buf) {
        if slot(buf, i).rec.is_unused() {
            del_slot(buf, i);
            dropped += 1;
        } else {
            i += 1;
        }
    }
    dropped
}

/// Append `(key, rec)` behind the current last slot, for the bulk
/// builder. The caller guarantees ordering. Returns false when full.
pub fn push_back(buf: &mut [u8], key: &[u8], rec: RecRef, left: DiskLoc) -> Result<bool> {
    let pos = n(buf);
    basic_insert(buf, pos, key, rec, left)
}

/// Remove and return the last slot, for the bulk builder's level
/// promotion.
pub fn pop_back(buf: &mut [u8]) -> Option<(Vec<u8>, RecRef, DiskLoc)> {
    let count = n(buf);
    if count == 0 {
        return None;
    }
    let s = slot(buf, count - 1);
    let key = slot_key(buf, count - 1).to_vec();
    del_slot(buf, count - 1);
    Some((key, s.rec, s.left))
}

/// Number of used (not tombstoned) slots.
pub fn live_slots(buf: &[u8]) -> usize {
    (0..n(buf)).filter(|i| !slot(buf, *i).rec.is_unused()).count()
}

#[cfg(test)]
#[path = "bucket_test.rs"]
mod bucket_test;
