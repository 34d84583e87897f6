//! Module `record` implement the record and deleted-record headers.
//!
//! Records within one extent form a doubly linked list in insertion order;
//! the links are bare offsets because record and neighbour always share a
//! file. A deleted record reinterprets the same slot with a single
//! `next_deleted` locator, threading it into the owning collection's
//! size-bucketed free lists.

use std::convert::TryFrom;

use crate::{
    loc::{DiskLoc, NULL_OFS},
    Error, Result,
};

/// Bytes of header in front of every record payload.
pub const REC_HDR_SIZE: usize = 16;

/// High bit of `len_with_hdr`, set while the slot sits on a deleted
/// list. Extents stay far below 2 GiB so the bit is free, and it lets a
/// stale locator be recognized instead of reading garbage.
pub const DELETED_MARK: u32 = 0x8000_0000;

/// Size classes for the deleted-record free lists, roughly powers of two.
pub const DELETED_BUCKETS: [u32; 19] = [
    32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 0x4000, 0x8000, 0x10000, 0x20000,
    0x40000, 0x80000, 0x100000, 0x200000, 0x400000, 0x800000,
];

/// Free-list bin for a record of `len` bytes with header: the largest
/// bucket whose size does not exceed `len`.
pub fn bucket_index(len: u32) -> usize {
    match DELETED_BUCKETS.iter().rposition(|sz| *sz <= len) {
        Some(i) => i,
        None => 0,
    }
}

/// Decoded record header.
#[derive(Clone, Debug)]
pub struct RecHdr {
    pub len_with_hdr: u32,
    pub extent_ofs: u32,
    pub prev_ofs: u32,
    pub next_ofs: u32,
}

impl RecHdr {
    pub fn new(len_with_hdr: u32, extent_ofs: u32) -> RecHdr {
        RecHdr { len_with_hdr, extent_ofs, prev_ofs: NULL_OFS, next_ofs: NULL_OFS }
    }

    pub fn load(buf: &[u8]) -> Result<RecHdr> {
        use std::convert::TryInto;

        if buf.len() < REC_HDR_SIZE {
            err_at!(Corruption, msg: "record header {} bytes", buf.len())?
        }
        Ok(RecHdr {
            len_with_hdr: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            extent_ofs: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            prev_ofs: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            next_ofs: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }

    pub fn store(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.len_with_hdr.to_le_bytes());
        buf[4..8].copy_from_slice(&self.extent_ofs.to_le_bytes());
        buf[8..12].copy_from_slice(&self.prev_ofs.to_le_bytes());
        buf[12..16].copy_from_slice(&self.next_ofs.to_le_bytes());
    }

    /// Payload capacity of the slot.
    pub fn capacity(&self) -> u32 {
        self.len_with_hdr - u32::try_from(REC_HDR_SIZE).unwrap()
    }

    /// True when the bytes at this locator are a deleted slot, not a
    /// live record.
    pub fn is_deleted_slot(&self) -> bool {
        self.len_with_hdr & DELETED_MARK != 0
    }

    /// Locator of the owning extent, given the record's own locator.
    pub fn extent_loc(&self, my_loc: DiskLoc) -> DiskLoc {
        DiskLoc::new(my_loc.fileno, self.extent_ofs)
    }

    pub fn prev_loc(&self, my_loc: DiskLoc) -> DiskLoc {
        DiskLoc::new(my_loc.fileno, self.prev_ofs)
    }

    pub fn next_loc(&self, my_loc: DiskLoc) -> DiskLoc {
        DiskLoc::new(my_loc.fileno, self.next_ofs)
    }
}

/// Bytes of header in front of a deleted slot.
pub const DEL_HDR_SIZE: usize = 16;

/// Decoded deleted-record header, occupying the slot the record held.
#[derive(Clone, Debug)]
pub struct DelHdr {
    pub len_with_hdr: u32,
    pub extent_ofs: u32,
    pub next_deleted: DiskLoc,
}

impl DelHdr {
    pub fn new(len_with_hdr: u32, extent_ofs: u32) -> DelHdr {
        DelHdr { len_with_hdr, extent_ofs, next_deleted: DiskLoc::NULL }
    }

    pub fn load(buf: &[u8]) -> Result<DelHdr> {
        use std::convert::TryInto;

        if buf.len() < DEL_HDR_SIZE {
            err_at!(Corruption, msg: "deleted header {} bytes", buf.len())?
        }
        Ok(DelHdr {
            len_with_hdr: u32::from_le_bytes(buf[0..4].try_into().unwrap()) & !DELETED_MARK,
            extent_ofs: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            next_deleted: DiskLoc::from_bytes(&buf[8..16])?,
        })
    }

    pub fn store(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&(self.len_with_hdr | DELETED_MARK).to_le_bytes());
        buf[4..8].copy_from_slice(&self.extent_ofs.to_le_bytes());
        buf[8..16].copy_from_slice(&self.next_deleted.to_bytes());
    }
}

#[cfg(test)]
#[path = "record_test.rs"]
mod record_test;
