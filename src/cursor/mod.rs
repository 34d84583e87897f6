//! Package implement the cursor framework.
//!
//! Two cursor families: table scans walking extent chains in physical
//! insertion order, and B-tree range scans walking index buckets in
//! comparator order. Both stay correct across mutation: before a record
//! is deleted the registry advances any cursor resting on it, and a
//! deallocated bucket flips the cursor into a lost-position state that
//! re-seeks from an owned copy of the current key on the next step.
//!
//! A cursor yields `(record locator, duplicate flag)` pairs lazily; the
//! duplicate flag fires on multikey indexes when one document was already
//! emitted through another of its keys. The end bound is checked before
//! unused-slot skipping so scans terminate.

use std::{collections::HashSet, sync::Arc};

use crate::{
    btree::{key, tree, KeyOrder},
    loc::DiskLoc,
    store::Inner,
    util::Spinlock,
    Error, Result,
};

pub mod registry;

pub use registry::CursorReg;

/// One scan interval for a B-tree cursor: begin at `start`, stop at
/// `end`. `start` leads `end` in scan direction; `start` is inclusive,
/// `end` per the flag. Multi-interval scans supply several in scan
/// direction.
#[derive(Clone, Debug)]
pub struct Interval {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub end_inclusive: bool,
}

/// Cursor state shared between the [Cursor] handle and the registry.
pub enum CursorCore {
    Table(TableCur),
    Index(IndexCur),
}

impl CursorCore {
    /// The record locator the cursor currently rests on, null when
    /// exhausted or unstarted.
    pub fn current_loc(&self) -> DiskLoc {
        match self {
            CursorCore::Table(c) if c.done => DiskLoc::NULL,
            CursorCore::Table(c) => c.cur_rec,
            CursorCore::Index(c) if c.done => DiskLoc::NULL,
            CursorCore::Index(c) => c.cur_rec,
        }
    }

    pub fn next(&mut self, inner: &Inner) -> Result<Option<(DiskLoc, bool)>> {
        match self {
            CursorCore::Table(c) => c.next(inner),
            CursorCore::Index(c) => c.next(inner),
        }
    }

    /// Registry callback: `loc` is about to be deleted, step off it.
    pub fn advance_past(&mut self, inner: &Inner, loc: DiskLoc) -> Result<()> {
        match self {
            CursorCore::Table(c) => c.advance_past(inner, loc),
            CursorCore::Index(c) => c.advance_past(inner, loc),
        }
    }

    /// Registry callback: the bucket at `loc` is going away.
    pub fn note_bucket_deleted(&mut self, loc: DiskLoc) {
        if let CursorCore::Index(c) = self {
            if c.bucket == loc {
                c.pos = -1;
            }
        }
    }

    /// Descriptor the cursor scans.
    pub fn desc_loc(&self) -> DiskLoc {
        match self {
            CursorCore::Table(c) => c.desc_loc,
            CursorCore::Index(c) => c.desc_loc,
        }
    }

    /// Terminate the cursor; its collection is going away.
    pub fn kill(&mut self) {
        match self {
            CursorCore::Table(c) => c.done = true,
            CursorCore::Index(c) => c.done = true,
        }
    }
}

/// Table-scan cursor walking the extent chain in physical order. Capped
/// collections get the ring topology: oldest extent first, the insertion
/// extent last.
pub struct TableCur {
    desc_loc: DiskLoc,
    dir: i8,
    capped: bool,
    cur_rec: DiskLoc,
    // ring terminus for capped scans.
    end_ext: DiskLoc,
    pending: bool,
    done: bool,
}

impl TableCur {
    pub fn new(inner: &Inner, desc_loc: DiskLoc, dir: i8) -> Result<TableCur> {
        let desc = inner.load_desc(desc_loc)?;
        let capped = desc.is_capped();
        let mut cur = TableCur {
            desc_loc,
            dir,
            capped,
            cur_rec: DiskLoc::NULL,
            end_ext: DiskLoc::NULL,
            pending: false,
            done: false,
        };

        let start_ext = if capped {
            let start = cur.ring_start(inner)?;
            cur.end_ext = if dir >= 0 { desc.cap_extent } else { start };
            if dir >= 0 {
                start
            } else {
                desc.cap_extent
            }
        } else if dir >= 0 {
            desc.first_extent
        } else {
            desc.last_extent
        };

        match cur.first_rec_from(inner, start_ext)? {
            Some(rec) => {
                cur.cur_rec = rec;
                cur.pending = true;
            }
            None => cur.done = true,
        }
        Ok(cur)
    }

    // the oldest extent of a capped ring: the one after the insertion
    // extent when the ring has wrapped, else the first extent.
    fn ring_start(&self, inner: &Inner) -> Result<DiskLoc> {
        let desc = inner.load_desc(self.desc_loc)?;
        let after = self.ring_next(inner, desc.cap_extent)?;
        let wrapped = match after {
            loc if loc.is_null() => false,
            loc if loc == desc.cap_extent => false,
            loc => !inner.load_extent(loc)?.first_rec.is_null(),
        };
        if wrapped {
            Ok(after)
        } else {
            Ok(desc.first_extent)
        }
    }

    fn ring_next(&self, inner: &Inner, ext: DiskLoc) -> Result<DiskLoc> {
        let hdr = inner.load_extent(ext)?;
        if hdr.next.is_null() {
            Ok(inner.load_desc(self.desc_loc)?.first_extent)
        } else {
            Ok(hdr.next)
        }
    }

    fn ring_prev(&self, inner: &Inner, ext: DiskLoc) -> Result<DiskLoc> {
        let hdr = inner.load_extent(ext)?;
        if hdr.prev.is_null() {
            Ok(inner.load_desc(self.desc_loc)?.last_extent)
        } else {
            Ok(hdr.prev)
        }
    }

    // first record at-or-after `ext` in scan order, hopping over empty
    // extents.
    fn first_rec_from(&self, inner: &Inner, mut ext: DiskLoc) -> Result<Option<DiskLoc>> {
        loop {
            if ext.is_null() {
                return Ok(None);
            }
            let hdr = inner.load_extent(ext)?;
            let rec = if self.dir >= 0 { hdr.first_rec } else { hdr.last_rec };
            if !rec.is_null() {
                return Ok(Some(rec));
            }
            match self.hop(inner, ext)? {
                Some(next) => ext = next,
                None => return Ok(None),
            }
        }
    }

    // next extent in scan order, honouring the capped ring terminus.
    fn hop(&self, inner: &Inner, ext: DiskLoc) -> Result<Option<DiskLoc>> {
        if self.capped {
            if ext == self.end_ext {
                return Ok(None);
            }
            let next = if self.dir >= 0 {
                self.ring_next(inner, ext)?
            } else {
                self.ring_prev(inner, ext)?
            };
            Ok(Some(next))
        } else {
            let hdr = inner.load_extent(ext)?;
            let next = if self.dir >= 0 { hdr.next } else { hdr.prev };
            if next.is_null() {
                Ok(None)
            } else {
                Ok(Some(next))
            }
        }
    }

    fn step(&mut self, inner: &Inner) -> Result<()> {
        use crate::loc::NULL_OFS;

        let hdr = inner.load_rec(self.cur_rec)?;
        let next_ofs = if self.dir >= 0 { hdr.next_ofs } else { hdr.prev_ofs };
        if next_ofs != NULL_OFS {
            self.cur_rec = DiskLoc::new(self.cur_rec.fileno, next_ofs);
            self.pending = true;
            return Ok(());
        }
        let ext = hdr.extent_loc(self.cur_rec);
        let from = self.hop(inner, ext)?;
        match from {
            Some(from) => match self.first_rec_from(inner, from)? {
                Some(rec) => {
                    self.cur_rec = rec;
                    self.pending = true;
                }
                None => self.done = true,
            },
            None => self.done = true,
        }
        Ok(())
    }

    pub fn next(&mut self, inner: &Inner) -> Result<Option<(DiskLoc, bool)>> {
        if self.done {
            return Ok(None);
        }
        if !self.pending {
            self.step(inner)?;
            if self.done {
                return Ok(None);
            }
        }
        self.pending = false;
        Ok(Some((self.cur_rec, false)))
    }

    fn advance_past(&mut self, inner: &Inner, loc: DiskLoc) -> Result<()> {
        while !self.done && self.cur_rec == loc {
            self.step(inner)?;
        }
        Ok(())
    }
}

// outcome of settling on a raw tree position.
enum Settled {
    Pending,
    Crossed,
    Exhausted,
}

/// B-tree range cursor over one index, driven by a list of intervals in
/// scan direction.
pub struct IndexCur {
    desc_loc: DiskLoc,
    idx_no: usize,
    order: KeyOrder,
    dir: i8,
    intervals: Vec<Interval>,
    bound_idx: usize,

    bucket: DiskLoc,
    // slot within bucket; -1 = position lost, re-seek from cur_key.
    pos: isize,
    cur_key: Vec<u8>,
    cur_rec: DiskLoc,
    pending: bool,
    done: bool,

    multikey: bool,
    seen: HashSet<u64>,
}

impl IndexCur {
    pub fn new(
        inner: &Inner,
        desc_loc: DiskLoc,
        idx_no: usize,
        order: KeyOrder,
        dir: i8,
        intervals: Vec<Interval>,
    ) -> Result<IndexCur> {
        if intervals.is_empty() {
            err_at!(InvalidInput, msg: "index scan without intervals")?
        }
        let desc = inner.load_desc(desc_loc)?;
        let mut cur = IndexCur {
            desc_loc,
            idx_no,
            order,
            dir,
            intervals,
            bound_idx: 0,

            bucket: DiskLoc::NULL,
            pos: -1,
            cur_key: Vec::default(),
            cur_rec: DiskLoc::NULL,
            pending: false,
            done: false,

            multikey: desc.is_multikey(idx_no),
            seen: HashSet::default(),
        };
        cur.seek_interval(inner)?;
        Ok(cur)
    }

    fn head(&self, inner: &Inner) -> Result<DiskLoc> {
        Ok(inner.load_desc(self.desc_loc)?.indexes[self.idx_no].head)
    }

    // does `key` lie beyond the active interval's end bound?
    fn crossed_end(&self, key: &[u8]) -> Result<bool> {
        use std::cmp::Ordering::{Equal, Greater, Less};

        let iv = &self.intervals[self.bound_idx];
        let ord = key::compare(key, &iv.end, &self.order)?;
        let crossed = match (self.dir >= 0, ord) {
            (_, Equal) => !iv.end_inclusive,
            (true, Greater) => true,
            (false, Less) => true,
            _ => false,
        };
        Ok(crossed)
    }

    // position at the active interval's start, settling on the first
    // yieldable slot; walks interval list forward as needed.
    fn seek_interval(&mut self, inner: &Inner) -> Result<()> {
        loop {
            if self.bound_idx >= self.intervals.len() {
                self.done = true;
                return Ok(());
            }
            let head = self.head(inner)?;
            let start = self.intervals[self.bound_idx].start.clone();
            let sentinel = if self.dir >= 0 { 0 } else { u64::MAX };
            match tree::locate(inner, head, &start, sentinel, self.dir, &self.order)? {
                None => {
                    self.done = true;
                    return Ok(());
                }
                Some((b, p)) => {
                    self.bucket = b;
                    self.pos = p as isize;
                    match self.settle(inner)? {
                        Settled::Pending => return Ok(()),
                        Settled::Crossed => {
                            self.bound_idx += 1;
                            continue;
                        }
                        Settled::Exhausted => {
                            self.done = true;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    // from the current raw position: enforce the end bound, then skip
    // unused slots, in that order, so scans terminate.
    fn settle(&mut self, inner: &Inner) -> Result<Settled> {
        loop {
            let (key, rec) = tree::key_at(inner, self.bucket, self.pos as usize)?;
            if self.crossed_end(&key)? {
                return Ok(Settled::Crossed);
            }
            if !rec.is_unused() {
                self.cur_key = key;
                self.cur_rec = rec.loc();
                self.pending = true;
                return Ok(Settled::Pending);
            }
            match tree::advance_raw(inner, self.bucket, self.pos as usize, self.dir)? {
                None => return Ok(Settled::Exhausted),
                Some((b, p)) => {
                    self.bucket = b;
                    self.pos = p as isize;
                }
            }
        }
    }

    // the snapshot (cur_key, cur_rec) no longer matches the slot, or the
    // bucket went away: find the position again from the key.
    fn reseek(&mut self, inner: &Inner) -> Result<()> {
        let head = self.head(inner)?;
        match tree::locate(
            inner,
            head,
            &self.cur_key.clone(),
            self.cur_rec.as_u64(),
            self.dir,
            &self.order,
        )? {
            None => {
                self.done = true;
            }
            Some((b, p)) => {
                self.bucket = b;
                self.pos = p as isize;
                let (key, rec) = tree::key_at(inner, self.bucket, p)?;
                if key == self.cur_key && rec.loc() == self.cur_rec {
                    // exact pair still present, resume in place; it was
                    // already yielded.
                    self.pending = false;
                } else {
                    match self.settle(inner)? {
                        Settled::Pending => (),
                        Settled::Crossed => {
                            self.bound_idx += 1;
                            self.seek_interval(inner)?;
                        }
                        Settled::Exhausted => self.done = true,
                    }
                }
            }
        }
        Ok(())
    }

    // is the slot under (bucket, pos) still the snapshot pair?
    fn position_ok(&self, inner: &Inner) -> Result<bool> {
        if self.pos < 0 {
            return Ok(false);
        }
        let page = match inner.read(self.bucket, inner.config.bucket_size) {
            Ok(page) => page,
            Err(_) => return Ok(false),
        };
        let pos = self.pos as usize;
        if pos >= crate::btree::bucket::n(page) {
            return Ok(false);
        }
        let slot = crate::btree::bucket::slot(page, pos);
        Ok(crate::btree::bucket::slot_key(page, pos) == &self.cur_key[..]
            && slot.rec.loc() == self.cur_rec)
    }

    pub fn next(&mut self, inner: &Inner) -> Result<Option<(DiskLoc, bool)>> {
        if self.done {
            return Ok(None);
        }
        if !self.pending {
            if !self.position_ok(inner)? {
                self.reseek(inner)?;
            }
            if self.done {
                return Ok(None);
            }
            if !self.pending {
                match tree::advance_raw(inner, self.bucket, self.pos as usize, self.dir)? {
                    None => {
                        self.done = true;
                        return Ok(None);
                    }
                    Some((b, p)) => {
                        self.bucket = b;
                        self.pos = p as isize;
                        match self.settle(inner)? {
                            Settled::Pending => (),
                            Settled::Crossed => {
                                self.bound_idx += 1;
                                self.seek_interval(inner)?;
                            }
                            Settled::Exhausted => self.done = true,
                        }
                    }
                }
            }
        }
        if self.done || !self.pending {
            self.done = true;
            return Ok(None);
        }
        self.pending = false;
        let dup = self.multikey && !self.seen.insert(self.cur_rec.as_u64());
        Ok(Some((self.cur_rec, dup)))
    }

    fn advance_past(&mut self, inner: &Inner, loc: DiskLoc) -> Result<()> {
        while !self.done && self.cur_rec == loc {
            if !self.position_ok(inner)? {
                self.reseek(inner)?;
                if self.pending && self.cur_rec != loc {
                    break;
                }
                if self.done {
                    break;
                }
            }
            match tree::advance_raw(inner, self.bucket, self.pos as usize, self.dir)? {
                None => {
                    self.done = true;
                }
                Some((b, p)) => {
                    self.bucket = b;
                    self.pos = p as isize;
                    match self.settle(inner)? {
                        Settled::Pending => (),
                        Settled::Crossed => {
                            self.bound_idx += 1;
                            self.seek_interval(inner)?;
                        }
                        Settled::Exhausted => self.done = true,
                    }
                }
            }
        }
        Ok(())
    }
}

/// Cursor handle returned to callers. Dropping it unregisters the
/// underlying state.
pub struct Cursor {
    id: u64,
    core: Arc<Spinlock<CursorCore>>,
    registry: Arc<CursorReg>,
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

impl Cursor {
    pub(crate) fn new(registry: Arc<CursorReg>, core: CursorCore) -> Result<Cursor> {
        let (id, core) = registry.register(core)?;
        Ok(Cursor { id, core, registry })
    }

    /// Registry id, never zero.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Step the cursor. Returns the record locator plus the multikey
    /// duplicate signal.
    pub fn advance(&mut self, inner: &Inner) -> Result<Option<(DiskLoc, bool)>> {
        let old = self.core.read().current_loc();
        let item = self.core.write().next(inner)?;
        let new = self.core.read().current_loc();
        self.registry.update_loc(self.id, old, new);
        Ok(item)
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
