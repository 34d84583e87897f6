//! Module `loc` implement the 64-bit on-disk address, aka disk-locator.
//!
//! A [DiskLoc] names a byte position as `(fileno, offset)` inside one of the
//! database's data files. Every on-disk reference in this package -- extent
//! chains, record chains, index buckets, descriptor slots -- is a `DiskLoc`
//! that is dereferenced on demand through the mapped files. Offsets handed
//! out by the record allocator are always even; the B-tree co-opts the low
//! offset bit of its slot references as the `unused` marker, modelled here
//! as the tagged [RecRef] type so the bit-stealing stays at the
//! serialization boundary.

use std::{cmp, fmt, result};

use crate::{Error, Result};

/// Offset value reserved to mean `null`.
pub const NULL_OFS: u32 = 0xFFFF_FFFF;

/// On-disk byte address `(fileno, offset)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiskLoc {
    pub fileno: u32,
    pub ofs: u32,
}

impl DiskLoc {
    /// The null locator.
    pub const NULL: DiskLoc = DiskLoc { fileno: 0xFFFF_FFFF, ofs: NULL_OFS };

    /// Number of bytes in the serialized form.
    pub const SIZE: usize = 8;

    pub fn new(fileno: u32, ofs: u32) -> DiskLoc {
        DiskLoc { fileno, ofs }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ofs == NULL_OFS
    }

    /// Advance by `n` bytes within the same file.
    #[inline]
    pub fn advance(&self, n: u32) -> DiskLoc {
        DiskLoc { fileno: self.fileno, ofs: self.ofs + n }
    }

    /// Widen to u64 preserving the `(fileno, ofs)` total order.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.fileno) << 32) | u64::from(self.ofs)
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0_u8; 8];
        buf[..4].copy_from_slice(&self.fileno.to_le_bytes());
        buf[4..].copy_from_slice(&self.ofs.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<DiskLoc> {
        use std::convert::TryInto;

        if buf.len() < Self::SIZE {
            err_at!(FailConvert, msg: "diskloc from {} bytes", buf.len())?
        }
        let fileno = u32::from_le_bytes(buf[..4].try_into().unwrap());
        let ofs = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Ok(DiskLoc { fileno, ofs })
    }
}

impl fmt::Display for DiskLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}:{:x}", self.fileno, self.ofs)
        }
    }
}

impl fmt::Debug for DiskLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

/// Tagged record reference stored in B-tree slots.
///
/// On disk this is a plain [DiskLoc] whose low offset bit carries the
/// `unused` flag; record offsets are even so the flag never aliases a real
/// address. In memory the flag is explicit.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecRef {
    loc: DiskLoc,
    unused: bool,
}

impl RecRef {
    pub const SIZE: usize = 8;

    /// Reference a live record. `loc.ofs` must be even.
    pub fn new(loc: DiskLoc) -> RecRef {
        debug_assert!(loc.is_null() || loc.ofs % 2 == 0);
        RecRef { loc, unused: false }
    }

    /// The record address, with the tag stripped.
    #[inline]
    pub fn loc(&self) -> DiskLoc {
        self.loc
    }

    #[inline]
    pub fn is_unused(&self) -> bool {
        self.unused
    }

    pub fn set_unused(&mut self) {
        self.unused = true;
    }

    pub fn set_used(&mut self) {
        self.unused = false;
    }

    /// Tie-break value for the index comparator, tag excluded.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.loc.as_u64()
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let ofs = if self.unused { self.loc.ofs | 1 } else { self.loc.ofs };
        DiskLoc::new(self.loc.fileno, ofs).to_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<RecRef> {
        let raw = DiskLoc::from_bytes(buf)?;
        if raw.is_null() {
            return Ok(RecRef { loc: raw, unused: false });
        }
        let unused = raw.ofs & 1 == 1;
        let loc = DiskLoc::new(raw.fileno, raw.ofs & !1);
        Ok(RecRef { loc, unused })
    }
}

impl cmp::PartialOrd for RecRef {
    fn partial_cmp(&self, other: &RecRef) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl cmp::Ord for RecRef {
    fn cmp(&self, other: &RecRef) -> cmp::Ordering {
        self.as_u64().cmp(&other.as_u64())
    }
}

impl fmt::Display for RecRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self.unused {
            true => write!(f, "{}*", self.loc),
            false => write!(f, "{}", self.loc),
        }
    }
}

impl fmt::Debug for RecRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
#[path = "loc_test.rs"]
mod loc_test;
