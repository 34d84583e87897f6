//! Module `catalog` implement the namespace catalog.
//!
//! The catalog is `system.namespaces`: a collection whose records are the
//! fixed-layout descriptors of every collection in the database --
//! including its own, anchored from file 0's header. Bootstrap carves the
//! first extent by hand, plants the catalog descriptor inside it, then
//! creates `system.indexes` and `$freelist` through the ordinary insert
//! path.

use log::info;

use std::{collections::HashMap, convert::TryFrom};

use crate::{
    loc::DiskLoc,
    store::{
        alloc,
        desc::{CollDesc, DESC_SIZE},
        extent::ExtentHdr,
        record::{bucket_index, DelHdr, RecHdr, REC_HDR_SIZE},
        Inner, FREELIST_NS, INDEXES_NS, NAMESPACES_NS,
    },
    util, Error, Result,
};

// first extent of the catalog.
const BOOT_EXTENT_SIZE: u32 = 64 * 1024;

/// Bootstrap the catalog in a store whose file 0 was just created. On
/// return the three system namespaces exist and file 0's header points at
/// the catalog descriptor.
pub fn bootstrap(inner: &mut Inner) -> Result<()> {
    let ext_loc = match alloc::carve_tail(inner, BOOT_EXTENT_SIZE)? {
        Some(loc) => loc,
        None => err_at!(StorageFull, msg: "file too small for catalog")?,
    };
    let mut ext = ExtentHdr::new(ext_loc, BOOT_EXTENT_SIZE, NAMESPACES_NS);

    // the catalog descriptor record, placed by hand right after the
    // extent header.
    let rec_loc = ext.data_loc();
    let rec_len = u32::try_from(util::align_up(REC_HDR_SIZE + DESC_SIZE, 8)).unwrap();
    let rec = RecHdr::new(rec_len, ext_loc.ofs);
    ext.first_rec = rec_loc;
    ext.last_rec = rec_loc;
    inner.store_extent(&ext)?;
    inner.store_rec(rec_loc, &rec)?;

    let mut desc = CollDesc::new(NAMESPACES_NS)?;
    desc.first_extent = ext_loc;
    desc.last_extent = ext_loc;
    desc.last_extent_size = BOOT_EXTENT_SIZE;
    desc.n_records = 1;
    desc.data_size = u64::from(rec_len) - REC_HDR_SIZE as u64;

    // the rest of the extent is one big deleted record.
    let tail_loc = rec_loc.advance(rec_len);
    let tail_len = ext.data_len() - rec_len;
    let mut tail = DelHdr::new(tail_len, ext_loc.ofs);
    let bin = bucket_index(tail_len);
    tail.next_deleted = DiskLoc::NULL;
    inner.store_del(tail_loc, &tail)?;
    desc.deleted[bin] = tail_loc;

    let buf = inner.write(rec_loc.advance(REC_HDR_SIZE as u32), DESC_SIZE)?;
    desc.store(buf);

    let mut header = inner.files.file(0)?.load_header()?;
    header.catalog = rec_loc;
    inner.files.file_mut(0)?.store_header(&header);
    inner.catalog.insert(NAMESPACES_NS.to_string(), rec_loc);

    // the remaining system namespaces go through the normal insert path.
    create_ns(inner, INDEXES_NS)?;
    create_ns(inner, FREELIST_NS)?;
    info!(target: "store", "bootstrapped catalog at {}", rec_loc);
    Ok(())
}

/// Create a namespace: a fresh descriptor record inserted into the
/// catalog. Returns the descriptor locator.
pub fn create_ns(inner: &mut Inner, name: &str) -> Result<DiskLoc> {
    if inner.catalog.contains_key(name) {
        err_at!(InvalidInput, msg: "namespace {:?} exists", name)?
    }
    let desc = CollDesc::new(name)?;
    let mut payload = vec![0; DESC_SIZE];
    desc.store(&mut payload);

    let cat_loc = inner.desc_loc(NAMESPACES_NS)?;
    let loc = inner.raw_insert(cat_loc, &payload, false)?;
    inner.catalog.insert(name.to_string(), loc);
    info!(target: "store", "created namespace {:?} at {}", name, loc);
    Ok(loc)
}

/// Remove a namespace's descriptor record from the catalog.
pub fn remove_ns(inner: &mut Inner, name: &str) -> Result<()> {
    let loc = match inner.catalog.remove(name) {
        Some(loc) => loc,
        None => err_at!(NsNotFound, msg: "{:?}", name)?,
    };
    let cat_loc = inner.desc_loc(NAMESPACES_NS)?;
    alloc::free_record(inner, cat_loc, loc)?;
    info!(target: "store", "removed namespace {:?}", name);
    Ok(())
}

/// Rebuild the in-memory name map by scanning the catalog's records.
pub fn load_catalog(inner: &Inner) -> Result<HashMap<String, DiskLoc>> {
    let cat_loc = inner.files.file(0)?.load_header()?.catalog;
    if cat_loc.is_null() {
        err_at!(Corruption, msg: "file 0 lost the catalog locator")?
    }
    let mut map = HashMap::new();
    let cat_desc = {
        let buf = inner.read(cat_loc.advance(REC_HDR_SIZE as u32), DESC_SIZE)?;
        CollDesc::load(buf)?
    };
    for loc in each_record(inner, &cat_desc)? {
        let buf = inner.read(loc.advance(REC_HDR_SIZE as u32), DESC_SIZE)?;
        let desc = CollDesc::load(buf)?;
        map.insert(desc.name.clone(), loc);
    }
    Ok(map)
}

/// Every record locator of a collection, extent chain order. Small
/// collections only; scans proper use cursors.
pub fn each_record(inner: &Inner, desc: &CollDesc) -> Result<Vec<DiskLoc>> {
    use crate::loc::NULL_OFS;

    let mut locs = vec![];
    let mut ext_loc = desc.first_extent;
    let mut hops = 0;
    while !ext_loc.is_null() {
        let ext = inner.load_extent(ext_loc)?;
        let mut rec_loc = ext.first_rec;
        while !rec_loc.is_null() {
            locs.push(rec_loc);
            let rec = inner.load_rec(rec_loc)?;
            rec_loc = match rec.next_ofs {
                NULL_OFS => DiskLoc::NULL,
                ofs => DiskLoc::new(rec_loc.fileno, ofs),
            };
        }
        ext_loc = ext.next;
        hops += 1;
        if hops > 1_000_000 {
            err_at!(Corruption, msg: "extent chain cycle in {:?}", desc.name)?
        }
    }
    Ok(locs)
}

#[cfg(test)]
#[path = "catalog_test.rs"]
mod catalog_test;
