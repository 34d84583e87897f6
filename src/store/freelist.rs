//! Module `freelist` implement the database-wide free-extent list.
//!
//! Extents owned by dropped collections end up on the `$freelist`
//! pseudo-namespace, keyed by nothing but their native length; allocation
//! scans the chain linearly for a length inside the request window. The
//! window is tight for capped collections, which size their rings
//! precisely, and generous for ordinary collections.

use log::warn;

use crate::{
    loc::DiskLoc,
    store::{Inner, FREELIST_NS},
    Error, Result,
};

// diagnostic threshold: a scan past this many extents logs a warning.
const SCAN_WARN: usize = 512;

/// Take the best-fitting extent off the free list, unlinking it. Returns
/// the extent locator and its native length. None when nothing in the
/// window fits.
pub fn take_from_freelist(
    inner: &mut Inner,
    approx: u32,
    capped: bool,
) -> Result<Option<(DiskLoc, u32)>> {
    let desc_loc = match inner.catalog.get(FREELIST_NS) {
        Some(loc) => *loc,
        None => return Ok(None),
    };
    let (low, high) = if capped {
        // be strict about the size.
        let low = if approx > 2048 { approx - 256 } else { approx };
        let high = (u64::from(approx) * 105 / 100 + 256) as u32;
        (low, high)
    } else {
        ((u64::from(approx) * 8 / 10) as u32, (u64::from(approx) * 14 / 10) as u32)
    };

    let mut desc = inner.load_desc(desc_loc)?;
    let mut best: Option<(DiskLoc, u32)> = None;
    let mut best_diff = u32::MAX;
    let mut n = 0;

    let mut cur = desc.first_extent;
    while !cur.is_null() {
        let ext = inner.load_extent(cur)?;
        if ext.length >= low && ext.length <= high {
            let diff = if ext.length > approx { ext.length - approx } else { approx - ext.length };
            if diff < best_diff {
                best_diff = diff;
                best = Some((cur, ext.length));
                if diff == 0 {
                    break;
                }
            }
        }
        cur = ext.next;
        n += 1;
    }
    if n > SCAN_WARN {
        warn!(target: "alloc", "free-extent scan examined {} extents", n);
    }

    let (loc, length) = match best {
        Some(best) => best,
        None => return Ok(None),
    };

    // unlink from the free chain.
    let ext = inner.load_extent(loc)?;
    if !ext.prev.is_null() {
        let mut prev = inner.load_extent(ext.prev)?;
        prev.next = ext.next;
        inner.store_extent(&prev)?;
    }
    if !ext.next.is_null() {
        let mut next = inner.load_extent(ext.next)?;
        next.prev = ext.prev;
        inner.store_extent(&next)?;
    }
    if desc.first_extent == loc {
        desc.first_extent = ext.next;
    }
    if desc.last_extent == loc {
        desc.last_extent = ext.prev;
    }
    inner.store_desc(desc_loc, &desc)?;

    Ok(Some((loc, length)))
}

/// Splice a dropped collection's whole extent chain `first..=last` onto
/// the free list's tail. O(1) in the chain length.
pub fn give_to_freelist(inner: &mut Inner, first: DiskLoc, last: DiskLoc) -> Result<()> {
    if first.is_null() {
        return Ok(());
    }
    let desc_loc = inner.desc_loc(FREELIST_NS)?;
    let mut desc = inner.load_desc(desc_loc)?;

    let mut head = inner.load_extent(first)?;
    head.prev = desc.last_extent;
    inner.store_extent(&head)?;

    if desc.last_extent.is_null() {
        desc.first_extent = first;
    } else {
        let mut tail = inner.load_extent(desc.last_extent)?;
        tail.next = first;
        inner.store_extent(&tail)?;
    }
    desc.last_extent = last;
    inner.store_desc(desc_loc, &desc)
}

#[cfg(test)]
#[path = "freelist_test.rs"]
mod freelist_test;
