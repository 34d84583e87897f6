//! Module `desc` implement the collection descriptor.
//!
//! A [CollDesc] is a fixed-layout system record living in
//! `system.namespaces`: extent-chain endpoints, record and byte counters,
//! the padding factor, capped-collection geometry, the 19 deleted-list
//! heads and up to [MAX_INDEXES] index slots. Each index slot pairs the
//! locator of its [IndexInfo] record (in `system.indexes`) with the
//! locator of its root bucket, so a root split updates eight fixed bytes
//! in place. The multikey bitset carries one bit per index slot.

use cbordata::Cborize;

use crate::{
    doc::Doc,
    loc::DiskLoc,
    store::record::DELETED_BUCKETS,
    Error, Result,
};

/// Width of the namespace-name field.
pub const NS_NAME_LEN: usize = 128;
/// Hard cap on indexes per collection; also the width of the multikey
/// bitset.
pub const MAX_INDEXES: usize = 64;
/// Number of deleted-record free lists.
pub const N_DELETED: usize = DELETED_BUCKETS.len();
/// Serialized size of a collection descriptor.
pub const DESC_SIZE: usize = 1384;

pub const FLAG_CAPPED: u32 = 0x1;
pub const FLAG_HAS_ID_INDEX: u32 = 0x2;

const INDEXES_OFF: usize = 360;

/// One index slot inside a descriptor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexSlot {
    /// Locator of the [IndexInfo] record in `system.indexes`.
    pub info: DiskLoc,
    /// Locator of the root bucket; null until the first key is inserted.
    pub head: DiskLoc,
}

impl IndexSlot {
    pub const NULL: IndexSlot = IndexSlot { info: DiskLoc::NULL, head: DiskLoc::NULL };
}

/// Decoded collection descriptor.
#[derive(Clone, Debug)]
pub struct CollDesc {
    pub name: String,
    pub first_extent: DiskLoc,
    pub last_extent: DiskLoc,
    pub last_extent_size: u32,
    pub flags: u32,
    pub n_records: u64,
    pub data_size: u64,
    pub padding: f32,
    pub n_indexes: u16,
    pub multikey: u64,
    pub capped_max_bytes: u64,
    pub capped_max_docs: u64,
    pub cap_extent: DiskLoc,
    pub deleted: [DiskLoc; N_DELETED],
    pub indexes: [IndexSlot; MAX_INDEXES],
}

impl CollDesc {
    pub fn new(name: &str) -> Result<CollDesc> {
        if name.len() >= NS_NAME_LEN {
            err_at!(InvalidInput, msg: "namespace {:?} too long", name)?
        }
        Ok(CollDesc {
            name: name.to_string(),
            first_extent: DiskLoc::NULL,
            last_extent: DiskLoc::NULL,
            last_extent_size: 0,
            flags: 0,
            n_records: 0,
            data_size: 0,
            padding: 1.0,
            n_indexes: 0,
            multikey: 0,
            capped_max_bytes: 0,
            capped_max_docs: 0,
            cap_extent: DiskLoc::NULL,
            deleted: [DiskLoc::NULL; N_DELETED],
            indexes: [IndexSlot::NULL; MAX_INDEXES],
        })
    }

    pub fn load(buf: &[u8]) -> Result<CollDesc> {
        use std::convert::TryInto;

        if buf.len() < DESC_SIZE {
            err_at!(Corruption, msg: "descriptor {} bytes", buf.len())?
        }
        let name = {
            let end = buf[..NS_NAME_LEN].iter().position(|b| *b == 0).unwrap_or(NS_NAME_LEN);
            err_at!(FailConvert, std::str::from_utf8(&buf[..end]))?.to_string()
        };
        let padding = {
            // a stored zero is a legacy value, treat as 1.0.
            let p = f32::from_le_bytes(buf[168..172].try_into().unwrap());
            if p == 0.0 {
                1.0
            } else {
                p.max(1.0).min(2.0)
            }
        };
        let mut deleted = [DiskLoc::NULL; N_DELETED];
        for (i, slot) in deleted.iter_mut().enumerate() {
            let off = 208 + i * 8;
            *slot = DiskLoc::from_bytes(&buf[off..off + 8])?;
        }
        let mut indexes = [IndexSlot::NULL; MAX_INDEXES];
        for (i, slot) in indexes.iter_mut().enumerate() {
            let off = INDEXES_OFF + i * 16;
            slot.info = DiskLoc::from_bytes(&buf[off..off + 8])?;
            slot.head = DiskLoc::from_bytes(&buf[off + 8..off + 16])?;
        }
        Ok(CollDesc {
            name,
            first_extent: DiskLoc::from_bytes(&buf[128..136])?,
            last_extent: DiskLoc::from_bytes(&buf[136..144])?,
            last_extent_size: u32::from_le_bytes(buf[144..148].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[148..152].try_into().unwrap()),
            n_records: u64::from_le_bytes(buf[152..160].try_into().unwrap()),
            data_size: u64::from_le_bytes(buf[160..168].try_into().unwrap()),
            padding,
            n_indexes: u16::from_le_bytes(buf[172..174].try_into().unwrap()),
            multikey: u64::from_le_bytes(buf[176..184].try_into().unwrap()),
            capped_max_bytes: u64::from_le_bytes(buf[184..192].try_into().unwrap()),
            capped_max_docs: u64::from_le_bytes(buf[192..200].try_into().unwrap()),
            cap_extent: DiskLoc::from_bytes(&buf[200..208])?,
            deleted,
            indexes,
        })
    }

    pub fn store(&self, buf: &mut [u8]) {
        for b in buf[..NS_NAME_LEN].iter_mut() {
            *b = 0;
        }
        buf[..self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[128..136].copy_from_slice(&self.first_extent.to_bytes());
        buf[136..144].copy_from_slice(&self.last_extent.to_bytes());
        buf[144..148].copy_from_slice(&self.last_extent_size.to_le_bytes());
        buf[148..152].copy_from_slice(&self.flags.to_le_bytes());
        buf[152..160].copy_from_slice(&self.n_records.to_le_bytes());
        buf[160..168].copy_from_slice(&self.data_size.to_le_bytes());
        buf[168..172].copy_from_slice(&self.padding.to_le_bytes());
        buf[172..174].copy_from_slice(&self.n_indexes.to_le_bytes());
        buf[174..176].copy_from_slice(&0_u16.to_le_bytes());
        buf[176..184].copy_from_slice(&self.multikey.to_le_bytes());
        buf[184..192].copy_from_slice(&self.capped_max_bytes.to_le_bytes());
        buf[192..200].copy_from_slice(&self.capped_max_docs.to_le_bytes());
        buf[200..208].copy_from_slice(&self.cap_extent.to_bytes());
        for (i, slot) in self.deleted.iter().enumerate() {
            let off = 208 + i * 8;
            buf[off..off + 8].copy_from_slice(&slot.to_bytes());
        }
        for (i, slot) in self.indexes.iter().enumerate() {
            let off = INDEXES_OFF + i * 16;
            buf[off..off + 8].copy_from_slice(&slot.info.to_bytes());
            buf[off + 8..off + 16].copy_from_slice(&slot.head.to_bytes());
        }
    }

    pub fn is_capped(&self) -> bool {
        self.flags & FLAG_CAPPED != 0
    }

    /// Nudge the padding factor down after an in-place update fit.
    pub fn padding_fits(&mut self) {
        self.padding = (self.padding - 0.01).max(1.0);
    }

    /// Nudge the padding factor up after an update forced a move.
    pub fn padding_too_small(&mut self) {
        self.padding = (self.padding + 0.6).min(2.0);
    }

    pub fn is_multikey(&self, idx: usize) -> bool {
        self.multikey & (1 << idx) != 0
    }

    pub fn set_multikey(&mut self, idx: usize) {
        self.multikey |= 1 << idx;
    }

    /// Claim the next free index slot.
    pub fn add_index(&mut self, info: DiskLoc, head: DiskLoc) -> Result<usize> {
        let idx = usize::from(self.n_indexes);
        if idx >= MAX_INDEXES {
            err_at!(InvalidInput, msg: "{} indexes on {:?}", MAX_INDEXES, self.name)?
        }
        self.indexes[idx] = IndexSlot { info, head };
        self.n_indexes += 1;
        Ok(idx)
    }

    /// Drop index slot `idx`, compacting the array and the multikey bits
    /// above it.
    pub fn remove_index(&mut self, idx: usize) {
        let n = usize::from(self.n_indexes);
        debug_assert!(idx < n);
        for i in idx..n - 1 {
            self.indexes[i] = self.indexes[i + 1];
        }
        self.indexes[n - 1] = IndexSlot::NULL;
        let below = self.multikey & ((1_u64 << idx) - 1);
        let above = (self.multikey >> (idx + 1)) << idx;
        self.multikey = below | above;
        self.n_indexes -= 1;
    }

    pub fn live_indexes(&self) -> &[IndexSlot] {
        &self.indexes[..usize::from(self.n_indexes)]
    }
}

/// Per-index metadata, the CBOR payload of a record in `system.indexes`.
#[derive(Clone, Debug, PartialEq, Cborize)]
pub struct IndexInfo {
    pub name: String,
    /// Ordering descriptor, a small document of `{field: +1 | -1}`.
    pub order: Doc,
    pub unique: bool,
    pub drop_dups: bool,
    /// Original user-supplied spec, kept for diagnostics.
    pub spec: Doc,
}

impl IndexInfo {
    const ID: &'static str = "recstore/indexinfo/0.1.0";
}

#[cfg(test)]
#[path = "desc_test.rs"]
mod desc_test;
