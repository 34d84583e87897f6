//! Module `alloc` implement record and extent allocation.
//!
//! Record space comes from the owning collection's size-bucketed deleted
//! lists; a miss grows the collection by one extent and retries. Extents
//! come from the database free-extent list when a dropped collection left
//! one of a suitable size, else they are carved from the newest data
//! file's unused tail, else the preallocator produces a whole new file.
//! All sizes are quantized to [ALLOC_ALIGN] so record offsets stay even.

use log::{debug, info};

use std::convert::TryFrom;

use crate::{
    loc::{DiskLoc, NULL_OFS},
    store::{
        extent::{ExtentHdr, EXTENT_HDR_SIZE},
        file::{DataFile, ALLOC_ALIGN, FILE_HDR_SIZE},
        freelist,
        record::{bucket_index, DelHdr, RecHdr, DELETED_BUCKETS, REC_HDR_SIZE},
        Inner,
    },
    util, Error, Result,
};

/// Ceiling for a single extent.
pub const EXTENT_SIZE_MAX: u32 = 0x3B9A_CA00; // 1_000_000_000

// deleted-list scan cutoff per size bucket.
const SCAN_CUTOFF: usize = 30;

/// Extent size for the first extent of a collection whose first record is
/// `len` bytes with header.
pub fn initial_extent_size(len: u32) -> u32 {
    let sz = if len < 1000 {
        u64::from(len) * 64
    } else {
        u64::from(len) * 16
    };
    let sz = std::cmp::min(sz, u64::from(EXTENT_SIZE_MAX));
    let z = (sz as u32) & 0xffff_ff00;
    std::cmp::max(z, round_up(len + EXTENT_HDR_SIZE as u32))
}

/// Extent size for a follow-up extent: grow 4x below 4 MB, 1.2x above,
/// never below what the triggering record needs.
pub fn followup_extent_size(len: u32, last_extent_size: u32) -> u32 {
    let x = initial_extent_size(len);
    let y = if last_extent_size < 4_000_000 {
        u64::from(last_extent_size) * 4
    } else {
        (u64::from(last_extent_size) * 12) / 10
    };
    let y = std::cmp::min(y, u64::from(EXTENT_SIZE_MAX)) as u32 & 0xffff_ff00;
    let sz = std::cmp::max(x, y);
    std::cmp::max(sz, round_up(len + EXTENT_HDR_SIZE as u32))
}

fn round_up(n: u32) -> u32 {
    u32::try_from(util::align_up(n as usize, ALLOC_ALIGN)).unwrap()
}

/// Try to place a record of `len_with_hdr` bytes out of the collection's
/// deleted lists. On success the record header is initialized and the
/// descriptor's free lists are updated, but the record is not yet linked
/// into its extent's chain. Returns None when nothing fits.
pub fn try_alloc(
    inner: &mut Inner,
    desc_loc: DiskLoc,
    len_with_hdr: u32,
) -> Result<Option<DiskLoc>> {
    let need = round_up(len_with_hdr);
    let mut desc = inner.load_desc(desc_loc)?;

    for bin in bucket_index(need)..DELETED_BUCKETS.len() {
        // walk the chain remembering the previous hop for unlinking.
        let mut prev = DiskLoc::NULL;
        let mut cur = desc.deleted[bin];
        let mut scanned = 0;
        while !cur.is_null() && scanned < SCAN_CUTOFF {
            let del = inner.load_del(cur)?;
            if del.len_with_hdr >= need {
                // unlink from the free list.
                if prev.is_null() {
                    desc.deleted[bin] = del.next_deleted;
                } else {
                    let mut p = inner.load_del(prev)?;
                    p.next_deleted = del.next_deleted;
                    inner.store_del(prev, &p)?;
                }

                let rec_len = split_residual(inner, &mut desc, cur, &del, need)?;
                let hdr = RecHdr::new(rec_len, del.extent_ofs);
                inner.store_rec(cur, &hdr)?;
                inner.store_desc(desc_loc, &desc)?;
                return Ok(Some(cur));
            }
            prev = cur;
            cur = del.next_deleted;
            scanned += 1;
        }
    }
    inner.store_desc(desc_loc, &desc)?;
    Ok(None)
}

// Split the chosen deleted slot: keep `need` bytes for the record, thread
// the residual back as a smaller deleted record, unless it is below the
// smallest size class.
fn split_residual(
    inner: &mut Inner,
    desc: &mut crate::store::desc::CollDesc,
    loc: DiskLoc,
    del: &DelHdr,
    need: u32,
) -> Result<u32> {
    let extra = del.len_with_hdr - need;
    if extra < DELETED_BUCKETS[0] {
        return Ok(del.len_with_hdr);
    }
    let res_loc = loc.advance(need);
    let mut residual = DelHdr::new(extra, del.extent_ofs);
    let bin = bucket_index(extra);
    residual.next_deleted = desc.deleted[bin];
    inner.store_del(res_loc, &residual)?;
    desc.deleted[bin] = res_loc;
    Ok(need)
}

/// Append a freshly allocated record to its extent's in-order chain.
pub fn link_record(inner: &mut Inner, loc: DiskLoc) -> Result<()> {
    let mut hdr = inner.load_rec(loc)?;
    let ext_loc = hdr.extent_loc(loc);
    let mut ext = inner.load_extent(ext_loc)?;

    if ext.last_rec.is_null() {
        ext.first_rec = loc;
        ext.last_rec = loc;
        hdr.prev_ofs = NULL_OFS;
        hdr.next_ofs = NULL_OFS;
    } else {
        let old_last = ext.last_rec;
        let mut last = inner.load_rec(old_last)?;
        last.next_ofs = loc.ofs;
        inner.store_rec(old_last, &last)?;
        hdr.prev_ofs = old_last.ofs;
        hdr.next_ofs = NULL_OFS;
        ext.last_rec = loc;
    }
    inner.store_rec(loc, &hdr)?;
    inner.store_extent(&ext)
}

/// Unlink `loc` from its extent's record chain, fixing the chain ends.
pub fn unlink_record(inner: &mut Inner, loc: DiskLoc) -> Result<()> {
    let hdr = inner.load_rec(loc)?;
    let ext_loc = hdr.extent_loc(loc);

    if hdr.prev_ofs != NULL_OFS {
        let prev_loc = hdr.prev_loc(loc);
        let mut prev = inner.load_rec(prev_loc)?;
        prev.next_ofs = hdr.next_ofs;
        inner.store_rec(prev_loc, &prev)?;
    }
    if hdr.next_ofs != NULL_OFS {
        let next_loc = hdr.next_loc(loc);
        let mut next = inner.load_rec(next_loc)?;
        next.prev_ofs = hdr.prev_ofs;
        inner.store_rec(next_loc, &next)?;
    }

    let mut ext = inner.load_extent(ext_loc)?;
    if ext.first_rec == loc {
        ext.first_rec = match hdr.next_ofs {
            NULL_OFS => DiskLoc::NULL,
            ofs => DiskLoc::new(loc.fileno, ofs),
        };
    }
    if ext.last_rec == loc {
        ext.last_rec = match hdr.prev_ofs {
            NULL_OFS => DiskLoc::NULL,
            ofs => DiskLoc::new(loc.fileno, ofs),
        };
    }
    inner.store_extent(&ext)
}

/// Free a record: unlink it, scrub the payload on debug builds and thread
/// the slot into the collection's sized free list.
pub fn free_record(inner: &mut Inner, desc_loc: DiskLoc, loc: DiskLoc) -> Result<()> {
    let hdr = inner.load_rec(loc)?;
    unlink_record(inner, loc)?;

    if cfg!(any(debug_assertions, feature = "debug")) {
        // scrub to notice invalid reuse.
        let len = hdr.len_with_hdr as usize - REC_HDR_SIZE;
        let buf = inner.write(loc.advance(REC_HDR_SIZE as u32), len)?;
        for b in buf.iter_mut() {
            *b = 0;
        }
    }

    let mut desc = inner.load_desc(desc_loc)?;
    let del = DelHdr::new(hdr.len_with_hdr, hdr.extent_ofs);
    if desc.is_capped() {
        // capped space is reclaimed only by ring rotation; mark the
        // slot but keep it off the free lists.
        inner.store_del(loc, &del)?;
    } else {
        let mut del = del;
        let bin = bucket_index(hdr.len_with_hdr);
        del.next_deleted = desc.deleted[bin];
        inner.store_del(loc, &del)?;
        desc.deleted[bin] = loc;
    }
    desc.n_records -= 1;
    desc.data_size -= u64::from(hdr.len_with_hdr) - REC_HDR_SIZE as u64;
    inner.store_desc(desc_loc, &desc)
}

/// Allocate an extent of at least `approx` bytes and link it as the new
/// last extent of the collection at `desc_loc`. Preference order: the
/// database free-extent list, the newest file's unused tail, a brand new
/// file from the preallocator.
pub fn alloc_extent(
    inner: &mut Inner,
    desc_loc: DiskLoc,
    ns: &str,
    approx: u32,
    capped: bool,
) -> Result<DiskLoc> {
    let approx = round_up(approx);

    let (loc, length) = match freelist::take_from_freelist(inner, approx, capped)? {
        Some((loc, length)) => (loc, length),
        None => match carve_tail(inner, approx)? {
            Some(loc) => (loc, approx),
            None => {
                grow_file(inner, approx)?;
                match carve_tail(inner, approx)? {
                    Some(loc) => (loc, approx),
                    None => err_at!(
                        StorageFull, msg: "no extent of {} for {:?}", approx, ns
                    )?,
                }
            }
        },
    };

    info!(target: "alloc", "new extent for {:?} size:{} loc:{}", ns, length, loc);

    // initialize the extent and hand its whole data area to the deleted
    // list, the record allocator carves it up from there.
    let mut ext = ExtentHdr::new(loc, length, ns);
    let mut desc = inner.load_desc(desc_loc)?;

    ext.prev = desc.last_extent;
    inner.store_extent(&ext)?;
    if desc.last_extent.is_null() {
        desc.first_extent = loc;
    } else {
        let mut last = inner.load_extent(desc.last_extent)?;
        last.next = loc;
        inner.store_extent(&last)?;
    }
    desc.last_extent = loc;
    desc.last_extent_size = length;

    if !capped {
        let data_len = ext.data_len();
        let mut del = DelHdr::new(data_len, loc.ofs);
        let bin = bucket_index(data_len);
        del.next_deleted = desc.deleted[bin];
        inner.store_del(ext.data_loc(), &del)?;
        desc.deleted[bin] = ext.data_loc();
    }
    inner.store_desc(desc_loc, &desc)?;
    Ok(loc)
}

// Carve `size` bytes from the newest file's unused tail.
pub fn carve_tail(inner: &mut Inner, size: u32) -> Result<Option<DiskLoc>> {
    let fileno = u32::try_from(inner.files.len()).unwrap() - 1;
    let mut header = inner.files.file(fileno)?.load_header()?;
    let ofs = u32::try_from(util::align_up(header.unused_ofs as usize, ALLOC_ALIGN)).unwrap();
    let waste = ofs - header.unused_ofs;
    if header.unused_len < size + waste {
        return Ok(None);
    }
    header.unused_ofs = ofs + size;
    header.unused_len -= size + waste;
    inner.files.file_mut(fileno)?.store_header(&header);
    debug!(target: "alloc", "carved {} bytes at {}:{:x}", size, fileno, ofs);
    Ok(Some(DiskLoc::new(fileno, ofs)))
}

/// Bring up a new data file so a bucket page can be carved.
pub fn grow_for_bucket(inner: &mut Inner) -> Result<()> {
    let size = u32::try_from(inner.config.bucket_size).unwrap();
    grow_file(inner, size)
}

// Bring up the next data file, sized by the doubling schedule but never
// smaller than the request.
fn grow_file(inner: &mut Inner, at_least: u32) -> Result<()> {
    let fileno = u32::try_from(inner.files.len()).unwrap();
    let size = std::cmp::max(
        inner.config.file_size(fileno),
        u64::from(at_least) + FILE_HDR_SIZE as u64,
    );
    let path = inner.config.file_path(fileno);
    info!(target: "alloc", "preallocating file {:?} size:{}", path, size);
    let fd = inner.prealloc.request(&path, size)?;
    let file = DataFile::create(&path, fileno, size, fd)?;
    inner.files.push(file);
    Ok(())
}

#[cfg(test)]
#[path = "alloc_test.rs"]
mod alloc_test;
