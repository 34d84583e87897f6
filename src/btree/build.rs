//! Module `build` implement the bottom-up bulk B-tree builder.
//!
//! The builder consumes a stream of `(key, locator)` pairs already sorted
//! by the index comparator -- the external sorter's output -- and fills
//! one in-memory page per tree level. When the level-0 page fills, its
//! largest key is popped and pushed into the level-1 page with the
//! finalized page's disk locator as left child, and so on upward. Commit
//! wires the trailing page of every level as the rightmost child of the
//! level above and fixes parent pointers in one sweep.

use log::debug;

use std::cmp;

use crate::{
    btree::{
        bucket,
        key::{self, IndexKey, KeyOrder},
        tree,
    },
    loc::{DiskLoc, RecRef},
    store::Inner,
    Error, Result,
};

/// Bottom-up builder for one index.
pub struct TreeBuilder {
    size: usize,
    order: KeyOrder,
    dups_allowed: bool,
    drop_dups: bool,

    levels: Vec<Vec<u8>>,
    last: Option<(Vec<u8>, u64)>,
    written: Vec<DiskLoc>,
    dup_drops: Vec<DiskLoc>,
    n_keys: u64,
}

impl TreeBuilder {
    pub fn new(
        size: usize,
        order: KeyOrder,
        dups_allowed: bool,
        drop_dups: bool,
    ) -> TreeBuilder {
        TreeBuilder {
            size,
            order,
            dups_allowed,
            drop_dups,

            levels: Vec::default(),
            last: None,
            written: Vec::default(),
            dup_drops: Vec::default(),
            n_keys: 0,
        }
    }

    /// Push the next pair. Pairs must arrive in comparator order; an
    /// equal key from a distinct record is a duplicate when duplicates
    /// are disallowed -- either an error or, with `drop_dups`, noted on
    /// the dup-drop list for the caller to delete from the collection.
    pub fn add_key(&mut self, inner: &mut Inner, key: &IndexKey, loc: DiskLoc) -> Result<()> {
        if key.len() > bucket::max_key_len(self.size) {
            err_at!(KeyTooLarge, msg: "key of {} bytes", key.len())?
        }

        if let Some((last_key, last_loc)) = &self.last {
            let ord = match key::compare(key.as_bytes(), last_key, &self.order)? {
                cmp::Ordering::Equal => loc.as_u64().cmp(last_loc),
                ord => ord,
            };
            match ord {
                cmp::Ordering::Less | cmp::Ordering::Equal => {
                    err_at!(Fatal, msg: "bulk keys out of order")?
                }
                cmp::Ordering::Greater => (),
            }
            let key_equal = key::compare(key.as_bytes(), last_key, &self.order)?
                == cmp::Ordering::Equal;
            if key_equal && !self.dups_allowed {
                if self.drop_dups {
                    self.dup_drops.push(loc);
                    return Ok(());
                }
                err_at!(DuplicateKey, msg: "key {:?} in bulk stream", key)?
            }
        }
        self.last = Some((key.as_bytes().to_vec(), loc.as_u64()));

        if self.levels.is_empty() {
            self.levels.push(self.fresh_page());
        }
        self.push_level(inner, 0, key.as_bytes(), RecRef::new(loc), DiskLoc::NULL)?;
        self.n_keys += 1;
        Ok(())
    }

    /// Finalize the partial page of every level, wiring each as the
    /// rightmost child of the level above. Returns the root locator, or
    /// null for an empty stream, plus the dup-drop list.
    pub fn commit(mut self, inner: &mut Inner) -> Result<(DiskLoc, Vec<DiskLoc>, u64)> {
        if self.levels.is_empty() {
            return Ok((DiskLoc::NULL, std::mem::take(&mut self.dup_drops), 0));
        }

        let mut child = self.write_page(inner, 0)?;
        for l in 1..self.levels.len() {
            if bucket::n(&self.levels[l]) == 0 {
                continue;
            }
            bucket::set_next_child(&mut self.levels[l], child);
            child = self.write_page(inner, l)?;
        }

        fix_parents(inner, child, DiskLoc::NULL)?;
        debug!(target: "btree", "bulk build root {} over {} keys", child, self.n_keys);
        Ok((child, std::mem::take(&mut self.dup_drops), self.n_keys))
    }

    /// Abandon the build, freeing every bucket written so far. The index
    /// head was never attached, so the tree simply disappears.
    pub fn abort(mut self, inner: &mut Inner) -> Result<()> {
        for loc in std::mem::take(&mut self.written).into_iter() {
            tree::free_bucket(inner, loc)?;
        }
        Ok(())
    }

    fn fresh_page(&self) -> Vec<u8> {
        let mut page = vec![0; self.size];
        bucket::init(&mut page, DiskLoc::NULL);
        page
    }

    // push into level `l`'s page; a full page is finalized and its
    // largest key promoted, possibly cascading.
    fn push_level(
        &mut self,
        inner: &mut Inner,
        l: usize,
        key: &[u8],
        rec: RecRef,
        left: DiskLoc,
    ) -> Result<()> {
        if bucket::push_back(&mut self.levels[l], key, rec, left)? {
            return Ok(());
        }

        // full: promote the largest key and finalize this page.
        let (pkey, prec, pleft) = bucket::pop_back(&mut self.levels[l]).unwrap();
        bucket::set_next_child(&mut self.levels[l], pleft);
        let dloc = self.write_page(inner, l)?;

        if self.levels.len() == l + 1 {
            self.levels.push(self.fresh_page());
        }
        self.push_level(inner, l + 1, &pkey, prec, dloc)?;

        // start over with the pending key.
        self.levels[l] = self.fresh_page();
        if !bucket::push_back(&mut self.levels[l], key, rec, left)? {
            err_at!(Fatal, msg: "key does not fit an empty bucket")?
        }
        Ok(())
    }

    // write level page to a fresh on-disk bucket and reset bookkeeping.
    fn write_page(&mut self, inner: &mut Inner, l: usize) -> Result<DiskLoc> {
        let dloc = tree::alloc_bucket(inner, DiskLoc::NULL)?;
        let page = inner.write(dloc, self.size)?;
        page.copy_from_slice(&self.levels[l]);
        self.written.push(dloc);
        Ok(dloc)
    }
}

// one sweep down the finished tree setting parent pointers.
fn fix_parents(inner: &mut Inner, loc: DiskLoc, parent: DiskLoc) -> Result<()> {
    let size = inner.config.bucket_size;
    let children: Vec<DiskLoc> = {
        let page = inner.write(loc, size)?;
        bucket::set_parent(page, parent);
        let mut children: Vec<DiskLoc> =
            (0..bucket::n(page)).map(|i| bucket::slot(page, i).left).collect();
        children.push(bucket::next_child(page));
        children
    };
    for child in children.into_iter() {
        if !child.is_null() {
            fix_parents(inner, child, loc)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "build_test.rs"]
mod build_test;
