//! Module `sort` implement the external sorter behind bulk index builds.
//!
//! `(key, locator)` pairs are buffered in memory up to a configured byte
//! budget, sorted with the owning index's comparator and spilled to a run
//! file under the data directory; `done` stitches the runs back together
//! with a heap-based k-way merge that yields pairs in comparator order.
//! The interrupt flag is probed at every chunk boundary. Run files are
//! unlinked as they drain, and any leftovers go when the sorter drops.

use log::debug;

use std::{
    cmp,
    collections::BinaryHeap,
    fs,
    io::{self, BufReader, BufWriter, Read, Seek, Write},
    path, rc::Rc,
};

use crate::{
    btree::key::{self, IndexKey, KeyOrder},
    ctx::Opctx,
    loc::DiskLoc,
    Error, Result,
};

/// Default in-memory budget for the external sorter, in bytes.
pub const SORT_BUDGET: usize = 100 * 1024 * 1024;

// every buffered pair costs key bytes plus locator plus length prefix.
const ITEM_OVERHEAD: usize = 12;

/// External sorter for `(key, locator)` pairs under one index ordering.
pub struct ExtSorter {
    dir: path::PathBuf,
    name: String,
    order: Rc<KeyOrder>,
    budget: usize,

    items: Vec<(IndexKey, DiskLoc)>,
    mem_bytes: usize,
    runs: Vec<path::PathBuf>,
}

impl Drop for ExtSorter {
    fn drop(&mut self) {
        for run in self.runs.drain(..) {
            fs::remove_file(&run).ok(); // NOTE: ignore remove errors.
        }
    }
}

impl ExtSorter {
    pub fn new(dir: &path::Path, name: &str, order: KeyOrder, budget: usize) -> ExtSorter {
        ExtSorter {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            order: Rc::new(order),
            budget,

            items: Vec::default(),
            mem_bytes: 0,
            runs: Vec::default(),
        }
    }

    /// Buffer one pair, spilling a sorted run once over budget.
    pub fn add(&mut self, key: IndexKey, loc: DiskLoc, ctx: &Opctx) -> Result<()> {
        self.mem_bytes += key.len() + ITEM_OVERHEAD;
        self.items.push((key, loc));
        if self.mem_bytes >= self.budget {
            ctx.check_interrupt()?;
            self.spill()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.runs.is_empty()
    }

    /// Finish adding and return the merged, ordered stream.
    pub fn done(mut self, ctx: &Opctx) -> Result<SortIter> {
        ctx.check_interrupt()?;
        if self.runs.is_empty() {
            let order = Rc::clone(&self.order);
            sort_items(&mut self.items, &order)?;
            let items = std::mem::take(&mut self.items);
            Ok(SortIter::Mem { items: items.into_iter() })
        } else {
            if !self.items.is_empty() {
                self.spill()?;
            }
            let order = Rc::clone(&self.order);
            let mut heap = BinaryHeap::new();
            let mut files = vec![];
            for run in self.runs.iter() {
                let mut iter = RunIter::open(run, order.len())?;
                if let Some((key, loc)) = iter.next_item()? {
                    heap.push(HeapItem {
                        key,
                        loc,
                        run: files.len(),
                        order: Rc::clone(&order),
                    });
                }
                files.push(iter);
            }
            // run files are unlinked by the sorter's drop; hand ownership
            // of the paths to the iterator instead.
            let runs = std::mem::take(&mut self.runs);
            Ok(SortIter::Merge { files, heap, runs })
        }
    }

    fn spill(&mut self) -> Result<()> {
        sort_items(&mut self.items, &self.order)?;

        let run = self
            .dir
            .join(format!("{}.sort.{}", self.name, self.runs.len()));
        debug!(target: "sort", "spill {} items to {:?}", self.items.len(), run);

        let fd = err_at!(
            IOError,
            fs::OpenOptions::new().write(true).create_new(true).open(&run),
            "spill {:?}",
            run
        )?;
        let mut w = BufWriter::new(fd);
        for (key, loc) in self.items.drain(..) {
            let kbytes = key.as_bytes();
            err_at!(IOError, w.write_all(&(kbytes.len() as u32).to_le_bytes()))?;
            err_at!(IOError, w.write_all(kbytes))?;
            err_at!(IOError, w.write_all(&loc.to_bytes()))?;
        }
        err_at!(IOError, w.flush())?;

        self.runs.push(run);
        self.mem_bytes = 0;
        Ok(())
    }
}

fn sort_items(items: &mut Vec<(IndexKey, DiskLoc)>, order: &KeyOrder) -> Result<()> {
    // validate every key once, the comparator below cannot fail after this.
    for (key, _) in items.iter() {
        IndexKey::from_bytes(key.as_bytes(), order.len())?;
    }
    items.sort_by(|(ka, la), (kb, lb)| {
        match key::compare(ka.as_bytes(), kb.as_bytes(), order) {
            Ok(cmp::Ordering::Equal) => la.as_u64().cmp(&lb.as_u64()),
            Ok(ord) => ord,
            Err(_) => unreachable!(),
        }
    });
    Ok(())
}

/// Ordered stream of `(key, locator)` pairs out of [ExtSorter::done].
pub enum SortIter {
    Mem {
        items: std::vec::IntoIter<(IndexKey, DiskLoc)>,
    },
    Merge {
        files: Vec<RunIter>,
        heap: BinaryHeap<HeapItem>,
        runs: Vec<path::PathBuf>,
    },
}

impl Drop for SortIter {
    fn drop(&mut self) {
        if let SortIter::Merge { runs, .. } = self {
            for run in runs.drain(..) {
                fs::remove_file(&run).ok(); // NOTE: ignore remove errors.
            }
        }
    }
}

impl Iterator for SortIter {
    type Item = Result<(IndexKey, DiskLoc)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            SortIter::Mem { items } => items.next().map(Ok),
            SortIter::Merge { files, heap, .. } => {
                let top = heap.pop()?;
                let item = (top.key, top.loc);
                match files[top.run].next_item() {
                    Ok(Some((key, loc))) => heap.push(HeapItem {
                        key,
                        loc,
                        run: top.run,
                        order: top.order,
                    }),
                    Ok(None) => (),
                    Err(err) => return Some(Err(err)),
                }
                Some(Ok(item))
            }
        }
    }
}

/// Min-heap entry; `Ord` is reversed so [BinaryHeap] pops the smallest
/// pair. Keys are validated at spill time, the comparator cannot fail.
pub struct HeapItem {
    key: IndexKey,
    loc: DiskLoc,
    run: usize,
    order: Rc<KeyOrder>,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &HeapItem) -> bool {
        self.cmp(other) == cmp::Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &HeapItem) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &HeapItem) -> cmp::Ordering {
        let ord = match key::compare(
            self.key.as_bytes(),
            other.key.as_bytes(),
            &self.order,
        ) {
            Ok(cmp::Ordering::Equal) => self.loc.as_u64().cmp(&other.loc.as_u64()),
            Ok(ord) => ord,
            Err(_) => unreachable!(),
        };
        ord.reverse()
    }
}

/// Sequential reader over one spilled run.
pub struct RunIter {
    fd: BufReader<fs::File>,
    n_fields: usize,
    remaining: u64,
}

impl RunIter {
    fn open(run: &path::Path, n_fields: usize) -> Result<RunIter> {
        let mut fd = err_at!(IOError, fs::File::open(run), "run {:?}", run)?;
        let remaining = err_at!(IOError, fd.seek(io::SeekFrom::End(0)))?;
        err_at!(IOError, fd.seek(io::SeekFrom::Start(0)))?;
        Ok(RunIter { fd: BufReader::new(fd), n_fields, remaining })
    }

    fn next_item(&mut self) -> Result<Option<(IndexKey, DiskLoc)>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let mut lenb = [0_u8; 4];
        err_at!(IOError, self.fd.read_exact(&mut lenb))?;
        let klen = u32::from_le_bytes(lenb) as usize;
        let mut buf = vec![0; klen + DiskLoc::SIZE];
        err_at!(IOError, self.fd.read_exact(&mut buf))?;
        self.remaining -= (4 + klen + DiskLoc::SIZE) as u64;

        let key = IndexKey::from_bytes(&buf[..klen], self.n_fields)?;
        let loc = DiskLoc::from_bytes(&buf[klen..])?;
        Ok(Some((key, loc)))
    }
}

#[cfg(test)]
#[path = "sort_test.rs"]
mod sort_test;
