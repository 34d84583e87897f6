//! Module `extent` implement the extent header and chain plumbing.
//!
//! An extent is a contiguous byte range carved from one data file's unused
//! tail, linked into exactly one chain: a collection's extent chain or the
//! database-wide free-extent chain. The header carries the chain links,
//! the in-extent record chain endpoints and a short diagnostic namespace
//! name. The magic is checked on every load.

use std::convert::TryFrom;

use crate::{loc::DiskLoc, Error, Result};

/// Extent magic, checked on every header load.
pub const EXTENT_MAGIC: u32 = 0x4142_4344;
/// Bytes reserved for the extent header.
pub const EXTENT_HDR_SIZE: usize = 80;
/// Width of the diagnostic namespace field.
pub const EXTENT_NS_LEN: usize = 32;

/// Decoded extent header.
#[derive(Clone, Debug)]
pub struct ExtentHdr {
    pub my_loc: DiskLoc,
    pub prev: DiskLoc,
    pub next: DiskLoc,
    pub length: u32,
    pub first_rec: DiskLoc,
    pub last_rec: DiskLoc,
    pub ns_diag: [u8; EXTENT_NS_LEN],
}

impl ExtentHdr {
    /// Fresh header for an extent of `length` bytes at `my_loc`.
    pub fn new(my_loc: DiskLoc, length: u32, ns: &str) -> ExtentHdr {
        let mut ns_diag = [0_u8; EXTENT_NS_LEN];
        let bytes = ns.as_bytes();
        let n = std::cmp::min(bytes.len(), EXTENT_NS_LEN);
        ns_diag[..n].copy_from_slice(&bytes[..n]);
        ExtentHdr {
            my_loc,
            prev: DiskLoc::NULL,
            next: DiskLoc::NULL,
            length,
            first_rec: DiskLoc::NULL,
            last_rec: DiskLoc::NULL,
            ns_diag,
        }
    }

    pub fn load(my_loc: DiskLoc, buf: &[u8]) -> Result<ExtentHdr> {
        use std::convert::TryInto;

        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != EXTENT_MAGIC {
            err_at!(Corruption, msg: "extent magic {:#x} at {}", magic, my_loc)?
        }
        let stored = DiskLoc::from_bytes(&buf[4..12])?;
        if stored != my_loc {
            err_at!(Corruption, msg: "extent self-loc {} at {}", stored, my_loc)?
        }
        let mut ns_diag = [0_u8; EXTENT_NS_LEN];
        ns_diag.copy_from_slice(&buf[48..48 + EXTENT_NS_LEN]);
        Ok(ExtentHdr {
            my_loc,
            prev: DiskLoc::from_bytes(&buf[12..20])?,
            next: DiskLoc::from_bytes(&buf[20..28])?,
            length: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            first_rec: DiskLoc::from_bytes(&buf[32..40])?,
            last_rec: DiskLoc::from_bytes(&buf[40..48])?,
            ns_diag,
        })
    }

    pub fn store(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
        buf[4..12].copy_from_slice(&self.my_loc.to_bytes());
        buf[12..20].copy_from_slice(&self.prev.to_bytes());
        buf[20..28].copy_from_slice(&self.next.to_bytes());
        buf[28..32].copy_from_slice(&self.length.to_le_bytes());
        buf[32..40].copy_from_slice(&self.first_rec.to_bytes());
        buf[40..48].copy_from_slice(&self.last_rec.to_bytes());
        buf[48..48 + EXTENT_NS_LEN].copy_from_slice(&self.ns_diag);
    }

    /// First usable byte offset inside the extent.
    pub fn data_loc(&self) -> DiskLoc {
        self.my_loc.advance(u32::try_from(EXTENT_HDR_SIZE).unwrap())
    }

    /// Usable bytes inside the extent, header excluded.
    pub fn data_len(&self) -> u32 {
        self.length - u32::try_from(EXTENT_HDR_SIZE).unwrap()
    }

    pub fn ns_diag_str(&self) -> String {
        let end = self.ns_diag.iter().position(|b| *b == 0).unwrap_or(EXTENT_NS_LEN);
        String::from_utf8_lossy(&self.ns_diag[..end]).to_string()
    }
}

#[cfg(test)]
#[path = "extent_test.rs"]
mod extent_test;
