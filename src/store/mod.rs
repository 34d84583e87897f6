//! Package implement the record store: memory-mapped data files holding
//! variable-length self-describing records, with ordered secondary access
//! through disk-resident B-trees.
//!
//! One [Store] value is one database. Every externally invoked operation
//! runs under the store's global readers-writer lock -- reads shared,
//! mutations exclusive -- and routes byte-level writes through the
//! durability collaborator before touching a mapped page.
//!
//! Three system pseudo-namespaces are created at bootstrap and are
//! refused as targets of drop and compact: `system.namespaces` (the
//! catalog of collection descriptors), `system.indexes` (index
//! descriptors) and `$freelist` (the free-extent pool).

use log::{debug, info, warn};

use std::{
    collections::HashMap,
    convert::TryFrom,
    ffi, fs, path,
    sync::Arc,
};

pub mod alloc;
pub mod catalog;
pub mod config;
pub mod desc;
pub mod extent;
pub mod file;
pub mod freelist;
pub mod record;

pub use config::Config;

use crate::{
    btree::{
        bucket, key, tree, IndexKey, KeyOrder, TreeBuilder,
    },
    ctx::Opctx,
    cursor::{Cursor, CursorCore, CursorReg, IndexCur, Interval, TableCur},
    doc::{Doc, Value},
    dur::{DirtyLog, Durability, Prealloc, SyncPrealloc},
    lock::GlobalLock,
    loc::DiskLoc,
    sort::ExtSorter,
    store::{
        desc::{CollDesc, IndexInfo, DESC_SIZE},
        extent::{ExtentHdr, EXTENT_HDR_SIZE},
        file::{DataFile, Files},
        record::{DelHdr, RecHdr, REC_HDR_SIZE},
    },
    util, Error, Result,
};

/// Catalog of collection descriptors.
pub const NAMESPACES_NS: &str = "system.namespaces";
/// Index descriptor records.
pub const INDEXES_NS: &str = "system.indexes";
/// Pool of extents owned by dropped collections.
pub const FREELIST_NS: &str = "$freelist";

fn is_system_ns(ns: &str) -> bool {
    ns.starts_with("system.") || ns.starts_with('$')
}

/// Options for [Store::create_collection].
#[derive(Clone, Debug, Default)]
pub struct CollOpts {
    pub capped: bool,
    /// Byte budget for a capped collection.
    pub max_bytes: u64,
    /// Optional document cap for a capped collection, 0 for none.
    pub max_docs: u64,
}

/// Per-index metadata resolved from the descriptor and its
/// `system.indexes` record.
#[derive(Clone)]
pub struct IndexMeta {
    pub idx_no: usize,
    pub name: String,
    pub order: KeyOrder,
    pub unique: bool,
    pub drop_dups: bool,
    pub head: DiskLoc,
}

/// Everything the global lock protects.
pub struct Inner {
    pub config: Config,
    pub files: Files,
    pub catalog: HashMap<String, DiskLoc>,
    pub dur: Box<dyn Durability + Send>,
    pub prealloc: Box<dyn Prealloc + Send>,
    pub registry: Arc<CursorReg>,
}

impl Inner {
    pub fn read(&self, loc: DiskLoc, len: usize) -> Result<&[u8]> {
        self.files.read(loc, len)
    }

    /// Mutable bytes at `loc`; the durability collaborator sees the
    /// range before the caller can touch it.
    pub fn write(&mut self, loc: DiskLoc, len: usize) -> Result<&mut [u8]> {
        self.dur.note_write(loc, u32::try_from(len).unwrap());
        self.files.slice_mut(loc, len)
    }

    pub fn load_rec(&self, loc: DiskLoc) -> Result<RecHdr> {
        RecHdr::load(self.read(loc, REC_HDR_SIZE)?)
    }

    pub fn store_rec(&mut self, loc: DiskLoc, hdr: &RecHdr) -> Result<()> {
        hdr.store(self.write(loc, REC_HDR_SIZE)?);
        Ok(())
    }

    pub fn load_del(&self, loc: DiskLoc) -> Result<DelHdr> {
        DelHdr::load(self.read(loc, record::DEL_HDR_SIZE)?)
    }

    pub fn store_del(&mut self, loc: DiskLoc, hdr: &DelHdr) -> Result<()> {
        hdr.store(self.write(loc, record::DEL_HDR_SIZE)?);
        Ok(())
    }

    pub fn load_extent(&self, loc: DiskLoc) -> Result<ExtentHdr> {
        ExtentHdr::load(loc, self.read(loc, EXTENT_HDR_SIZE)?)
    }

    pub fn store_extent(&mut self, hdr: &ExtentHdr) -> Result<()> {
        hdr.store(self.write(hdr.my_loc, EXTENT_HDR_SIZE)?);
        Ok(())
    }

    pub fn load_desc(&self, desc_loc: DiskLoc) -> Result<CollDesc> {
        CollDesc::load(self.read(desc_loc.advance(REC_HDR_SIZE as u32), DESC_SIZE)?)
    }

    pub fn store_desc(&mut self, desc_loc: DiskLoc, desc: &CollDesc) -> Result<()> {
        desc.store(self.write(desc_loc.advance(REC_HDR_SIZE as u32), DESC_SIZE)?);
        Ok(())
    }

    pub fn desc_loc(&self, ns: &str) -> Result<DiskLoc> {
        match self.catalog.get(ns) {
            Some(loc) => Ok(*loc),
            None => err_at!(NsNotFound, msg: "{:?}", ns),
        }
    }

    /// Record payload bytes, header stripped.
    pub fn rec_payload(&self, loc: DiskLoc) -> Result<&[u8]> {
        let hdr = self.load_rec(loc)?;
        if hdr.is_deleted_slot() {
            err_at!(KeyNotFound, msg: "record {} deleted", loc)?
        }
        self.read(loc.advance(REC_HDR_SIZE as u32), hdr.capacity() as usize)
    }

    /// Decode the document at `loc`.
    pub fn fetch_doc(&self, loc: DiskLoc) -> Result<Doc> {
        Ok(util::from_cbor_bytes(self.rec_payload(loc)?)?.0)
    }

    /// Place a record without touching any index: allocation, extent
    /// growth, chain link, payload copy, counters. Not for capped
    /// collections.
    pub fn raw_insert(
        &mut self,
        desc_loc: DiskLoc,
        payload: &[u8],
        use_padding: bool,
    ) -> Result<DiskLoc> {
        let desc = self.load_desc(desc_loc)?;
        if desc.is_capped() {
            err_at!(Fatal, msg: "raw insert into capped {:?}", desc.name)?
        }
        let len_wh = u32::try_from(REC_HDR_SIZE + payload.len()).unwrap();
        let padded = if use_padding {
            (f64::from(len_wh) * f64::from(desc.padding)).ceil() as u32
        } else {
            len_wh
        };

        let loc = match alloc::try_alloc(self, desc_loc, padded)? {
            Some(loc) => loc,
            None => {
                let size = if desc.last_extent_size == 0 {
                    alloc::initial_extent_size(padded)
                } else {
                    alloc::followup_extent_size(padded, desc.last_extent_size)
                };
                alloc::alloc_extent(self, desc_loc, &desc.name, size, false)?;
                match alloc::try_alloc(self, desc_loc, padded)? {
                    Some(loc) => loc,
                    None => err_at!(
                        StorageFull, msg: "alloc failed after new extent for {:?}",
                        desc.name
                    )?,
                }
            }
        };
        alloc::link_record(self, loc)?;

        let buf = self.write(loc.advance(REC_HDR_SIZE as u32), payload.len())?;
        buf.copy_from_slice(payload);

        let hdr = self.load_rec(loc)?;
        let mut desc = self.load_desc(desc_loc)?;
        desc.n_records += 1;
        desc.data_size += u64::from(hdr.capacity());
        self.store_desc(desc_loc, &desc)?;
        Ok(loc)
    }

    /// Resolve the index metadata of every live index on the collection.
    pub fn index_metas(&self, desc: &CollDesc) -> Result<Vec<IndexMeta>> {
        let mut metas = vec![];
        for (idx_no, slot) in desc.live_indexes().iter().enumerate() {
            let (info, _) = util::from_cbor_bytes::<IndexInfo>(self.rec_payload(slot.info)?)?;
            let order = KeyOrder::from_doc(&info.order)?;
            metas.push(IndexMeta {
                idx_no,
                name: info.name,
                order,
                unique: info.unique,
                drop_dups: info.drop_dups,
                head: slot.head,
            });
        }
        Ok(metas)
    }

    pub fn commit_if_needed(&mut self) -> Result<bool> {
        if self.dur.should_commit() {
            self.commit_now()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Flush every declared-dirty range through the maps.
    pub fn commit_now(&mut self) -> Result<()> {
        for (loc, len) in self.dur.take_dirty().into_iter() {
            self.files.flush_range(loc, len as usize)?;
        }
        Ok(())
    }
}

/// A database: mapped data files, a catalog of collections, B-tree
/// indexes, cursors, one global lock.
pub struct Store {
    config: Config,
    registry: Arc<CursorReg>,
    lock: GlobalLock<Inner>,
}

impl Store {
    /// Create a fresh store under `config.dir`, with default
    /// collaborators.
    pub fn create(config: Config) -> Result<Store> {
        let dur = Box::new(DirtyLog::new(config.commit_bytes));
        Store::create_with(config, dur, Box::new(SyncPrealloc::default()))
    }

    /// Create a fresh store with explicit durability and preallocation
    /// collaborators.
    pub fn create_with(
        config: Config,
        dur: Box<dyn Durability + Send>,
        mut prealloc: Box<dyn Prealloc + Send>,
    ) -> Result<Store> {
        err_at!(IOError, fs::create_dir_all(&config.dir))?;
        let registry = Arc::new(CursorReg::new());

        let path = config.file_path(0);
        if path.exists() {
            err_at!(InvalidInput, msg: "store {:?} already exists", config.name)?
        }
        let size = config.file_size(0);
        let fd = prealloc.request(&path, size)?;
        let mut file0 = DataFile::create(&path, 0, size, fd)?;
        let mut header = file0.load_header()?;
        header.bucket_size = u32::try_from(config.bucket_size).unwrap();
        file0.store_header(&header);

        let mut files = Files::new();
        files.push(file0);

        let mut inner = Inner {
            config: config.clone(),
            files,
            catalog: HashMap::new(),
            dur,
            prealloc,
            registry: Arc::clone(&registry),
        };
        catalog::bootstrap(&mut inner)?;
        inner.commit_now()?;
        info!(target: "store", "created store {:?} in {:?}", config.name, config.dir);
        Ok(Store { config, registry, lock: GlobalLock::new(inner) })
    }

    /// Open an existing store, with default collaborators.
    pub fn open(dir: &ffi::OsStr, name: &str) -> Result<Store> {
        let config = Config::new(dir, name);
        let dur = Box::new(DirtyLog::new(config.commit_bytes));
        Store::open_with(config, dur, Box::new(SyncPrealloc::default()))
    }

    /// Open an existing store with explicit collaborators.
    pub fn open_with(
        mut config: Config,
        dur: Box<dyn Durability + Send>,
        prealloc: Box<dyn Prealloc + Send>,
    ) -> Result<Store> {
        let files = Files::open(&config)?;
        let header = files.file(0)?.load_header()?;
        if header.bucket_size != 0 {
            config.bucket_size = header.bucket_size as usize;
        }
        let registry = Arc::new(CursorReg::new());
        let mut inner = Inner {
            config: config.clone(),
            files,
            catalog: HashMap::new(),
            dur,
            prealloc,
            registry: Arc::clone(&registry),
        };
        inner.catalog = catalog::load_catalog(&inner)?;
        info!(
            target: "store",
            "opened store {:?}, {} namespaces", config.name, inner.catalog.len()
        );
        Ok(Store { config, registry, lock: GlobalLock::new(inner) })
    }

    /// Flush all pending mutations and unmap. Open cursors die with the
    /// store.
    pub fn close(self) -> Result<()> {
        let mut guard = self.lock.write();
        guard.commit_now()?;
        Ok(())
    }

    pub fn to_config(&self) -> Config {
        self.config.clone()
    }

    /// Force an immediate durability flush.
    pub fn commit_now(&self) -> Result<()> {
        self.lock.write().commit_now()
    }

    pub fn list_collections(&self) -> Vec<String> {
        let guard = self.lock.read();
        let mut names: Vec<String> = guard.catalog.keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a collection. Capped collections preallocate their whole
    /// ring of extents up front; documents in them never move and never
    /// grow.
    pub fn create_collection(&self, ns: &str, opts: CollOpts, ctx: &Opctx) -> Result<()> {
        ctx.check_interrupt()?;
        if is_system_ns(ns) {
            err_at!(InvalidInput, msg: "cannot create {:?}", ns)?
        }
        let mut guard = self.lock.write();
        let inner = &mut *guard;

        let desc_loc = catalog::create_ns(inner, ns)?;
        if opts.capped {
            if opts.max_bytes == 0 {
                err_at!(InvalidInput, msg: "capped collection without max_bytes")?
            }
            let mut remaining = opts.max_bytes;
            while remaining > 0 {
                let want = std::cmp::min(
                    remaining + EXTENT_HDR_SIZE as u64,
                    u64::from(alloc::EXTENT_SIZE_MAX),
                );
                let want = std::cmp::max(want, 4096) as u32;
                let loc = alloc::alloc_extent(inner, desc_loc, ns, want, true)?;
                let ext = inner.load_extent(loc)?;
                remaining = remaining.saturating_sub(u64::from(ext.data_len()));
            }
            let mut desc = inner.load_desc(desc_loc)?;
            desc.flags |= desc::FLAG_CAPPED;
            desc.capped_max_bytes = opts.max_bytes;
            desc.capped_max_docs = opts.max_docs;
            desc.cap_extent = desc.first_extent;
            inner.store_desc(desc_loc, &desc)?;
        }
        inner.commit_if_needed()?;
        Ok(())
    }

    /// Drop a collection: indexes freed, extents spliced onto the free
    /// list, catalog record removed, open cursors on it invalidated.
    pub fn drop_collection(&self, ns: &str, ctx: &Opctx) -> Result<()> {
        ctx.check_interrupt()?;
        if is_system_ns(ns) {
            err_at!(InvalidInput, msg: "cannot drop {:?}", ns)?
        }
        let mut guard = self.lock.write();
        let inner = &mut *guard;

        let desc_loc = inner.desc_loc(ns)?;
        let registry = Arc::clone(&inner.registry);
        registry.invalidate_ns(desc_loc);

        let desc = inner.load_desc(desc_loc)?;
        let metas = inner.index_metas(&desc)?;
        let idx_desc_loc = inner.desc_loc(INDEXES_NS)?;
        for meta in metas.into_iter() {
            tree::free_tree(inner, meta.head)?;
            let info_loc = desc.indexes[meta.idx_no].info;
            alloc::free_record(inner, idx_desc_loc, info_loc)?;
        }

        freelist::give_to_freelist(inner, desc.first_extent, desc.last_extent)?;
        catalog::remove_ns(inner, ns)?;
        inner.commit_if_needed()?;
        info!(target: "store", "dropped {:?}", ns);
        Ok(())
    }

    /// Insert a document, maintaining every secondary index. Returns the
    /// record locator.
    pub fn insert(&self, ns: &str, doc: &Doc, ctx: &Opctx) -> Result<DiskLoc> {
        ctx.check_interrupt()?;
        let mut guard = self.lock.write();
        let inner = &mut *guard;
        let desc_loc = inner.desc_loc(ns)?;
        let loc = doc_insert(inner, desc_loc, doc).map_err(|e| {
            ctx.set_last_error(&e);
            e
        })?;
        inner.commit_if_needed()?;
        Ok(loc)
    }

    /// Update the document at `loc`. In place when the new payload fits
    /// the slot; otherwise the record moves and the returned locator
    /// differs. The duplicate-key pre-pass runs before any index is
    /// mutated.
    pub fn update(&self, ns: &str, loc: DiskLoc, doc: &Doc, ctx: &Opctx) -> Result<DiskLoc> {
        ctx.check_interrupt()?;
        let mut guard = self.lock.write();
        let inner = &mut *guard;
        let desc_loc = inner.desc_loc(ns)?;
        let loc = doc_update(inner, desc_loc, loc, doc).map_err(|e| {
            ctx.set_last_error(&e);
            e
        })?;
        inner.commit_if_needed()?;
        Ok(loc)
    }

    /// Delete the record at `loc`. Not allowed on capped collections.
    pub fn delete(&self, ns: &str, loc: DiskLoc, ctx: &Opctx) -> Result<()> {
        ctx.check_interrupt()?;
        let mut guard = self.lock.write();
        let inner = &mut *guard;
        let desc_loc = inner.desc_loc(ns)?;
        let desc = inner.load_desc(desc_loc)?;
        if desc.is_capped() {
            err_at!(InvalidInput, msg: "cannot delete from capped {:?}", ns)?
        }
        doc_delete(inner, desc_loc, loc)?;
        inner.commit_if_needed()?;
        Ok(())
    }

    /// Fetch and decode the document at `loc`.
    pub fn fetch(&self, loc: DiskLoc) -> Result<Doc> {
        self.lock.read().fetch_doc(loc)
    }

    /// Build a secondary index over the collection, bottom-up through
    /// the external sorter. With `unique` and `drop_dups`, documents
    /// that would collide are deleted instead of failing the build.
    pub fn create_index(
        &self,
        ns: &str,
        index_name: &str,
        order_spec: &Doc,
        unique: bool,
        drop_dups: bool,
        ctx: &Opctx,
    ) -> Result<()> {
        ctx.check_interrupt()?;
        let mut guard = self.lock.write();
        let inner = &mut *guard;
        let desc_loc = inner.desc_loc(ns)?;
        build_index(inner, desc_loc, ns, index_name, order_spec, unique, drop_dups, ctx)
            .map_err(|e| {
                ctx.set_last_error(&e);
                e
            })?;
        inner.commit_if_needed()?;
        Ok(())
    }

    /// Drop one index by name.
    pub fn drop_index(&self, ns: &str, index_name: &str, ctx: &Opctx) -> Result<()> {
        ctx.check_interrupt()?;
        let mut guard = self.lock.write();
        let inner = &mut *guard;
        let desc_loc = inner.desc_loc(ns)?;
        let desc = inner.load_desc(desc_loc)?;
        let metas = inner.index_metas(&desc)?;
        let meta = match metas.into_iter().find(|m| m.name == index_name) {
            Some(meta) => meta,
            None => err_at!(KeyNotFound, msg: "index {:?} on {:?}", index_name, ns)?,
        };
        tree::free_tree(inner, meta.head)?;
        let idx_desc_loc = inner.desc_loc(INDEXES_NS)?;
        alloc::free_record(inner, idx_desc_loc, desc.indexes[meta.idx_no].info)?;
        let mut desc = inner.load_desc(desc_loc)?;
        desc.remove_index(meta.idx_no);
        inner.store_desc(desc_loc, &desc)?;
        inner.commit_if_needed()?;
        Ok(())
    }

    /// Open a table-scan cursor, `dir` +1 forward, -1 reverse. Capped
    /// collections scan in logical insertion order around the ring.
    pub fn scan(&self, ns: &str, dir: i8) -> Result<Cursor> {
        let guard = self.lock.read();
        let inner = &*guard;
        let desc_loc = inner.desc_loc(ns)?;
        let core = CursorCore::Table(TableCur::new(inner, desc_loc, dir)?);
        Cursor::new(Arc::clone(&self.registry), core)
    }

    /// Open a B-tree range cursor over `[start, end]` in `dir`;
    /// unbounded ends use the min/max sentinels. Values are one per
    /// ordering field.
    pub fn index_scan(
        &self,
        ns: &str,
        index_name: &str,
        dir: i8,
        start: Option<Vec<Value>>,
        end: Option<Vec<Value>>,
        end_inclusive: bool,
    ) -> Result<Cursor> {
        let guard = self.lock.read();
        let inner = &*guard;
        let (desc_loc, meta) = resolve_index(inner, ns, index_name)?;

        let lo = |v: Option<Vec<Value>>, fwd: bool| -> Result<Vec<u8>> {
            match v {
                Some(values) => Ok(IndexKey::encode(&values)?.as_bytes().to_vec()),
                None if fwd => Ok(key::min_key(&meta.order).as_bytes().to_vec()),
                None => Ok(key::max_key(&meta.order).as_bytes().to_vec()),
            }
        };
        let interval = Interval {
            start: lo(start, dir >= 0)?,
            end: lo(end, dir < 0)?,
            end_inclusive,
        };
        let core = CursorCore::Index(IndexCur::new(
            inner,
            desc_loc,
            meta.idx_no,
            meta.order.clone(),
            dir,
            vec![interval],
        )?);
        Cursor::new(Arc::clone(&self.registry), core)
    }

    /// Open a multi-interval B-tree cursor; intervals must be supplied
    /// in scan direction to give a single monotone output stream.
    pub fn index_scan_intervals(
        &self,
        ns: &str,
        index_name: &str,
        dir: i8,
        intervals: Vec<Interval>,
    ) -> Result<Cursor> {
        let guard = self.lock.read();
        let inner = &*guard;
        let (desc_loc, meta) = resolve_index(inner, ns, index_name)?;
        let core = CursorCore::Index(IndexCur::new(
            inner,
            desc_loc,
            meta.idx_no,
            meta.order.clone(),
            dir,
            intervals,
        )?);
        Cursor::new(Arc::clone(&self.registry), core)
    }

    /// Step a cursor, decoding the document. Multikey duplicates are
    /// suppressed here; the raw duplicate signal is available through
    /// [Cursor::advance].
    pub fn cursor_next(&self, cursor: &mut Cursor, ctx: &Opctx) -> Result<Option<(DiskLoc, Doc)>> {
        loop {
            ctx.check_interrupt()?;
            let guard = self.lock.read();
            let inner = &*guard;
            match cursor.advance(inner)? {
                None => return Ok(None),
                Some((_, true)) => continue,
                Some((loc, false)) => {
                    let doc = inner.fetch_doc(loc)?;
                    return Ok(Some((loc, doc)));
                }
            }
        }
    }

    /// Drain up to `n` documents holding the shared lock once, honouring
    /// the yield hint between items: the lock is released for the
    /// configured pause and re-acquired, cursors re-validating their
    /// position from the owned key snapshot they maintain.
    pub fn cursor_next_batch(
        &self,
        cursor: &mut Cursor,
        n: usize,
        ctx: &Opctx,
    ) -> Result<Vec<(DiskLoc, Doc)>> {
        let pause = std::time::Duration::from_micros(self.config.yield_micros);
        let mut out = Vec::with_capacity(n);
        let guard = self.lock.read();
        let inner = &*guard;
        while out.len() < n {
            ctx.check_interrupt()?;
            if ctx.take_yield_hint() {
                // yield point: cursors keep their snapshot current, so
                // releasing here is safe.
                self.lock.temp_release(pause);
            }
            match cursor.advance(inner)? {
                None => break,
                Some((_, true)) => continue,
                Some((loc, false)) => {
                    let doc = inner.fetch_doc(loc)?;
                    out.push((loc, doc));
                }
            }
        }
        Ok(out)
    }

    /// Rewrite the collection tightly and rebuild its indexes through
    /// the external sorter. Refuses system namespaces and capped
    /// collections. Interruptible at extent boundaries; on interrupt the
    /// collection is left consistent with whatever fraction compacted.
    pub fn compact(&self, ns: &str, ctx: &Opctx) -> Result<()> {
        ctx.check_interrupt()?;
        if is_system_ns(ns) {
            err_at!(InvalidInput, msg: "cannot compact {:?}", ns)?
        }
        let mut guard = self.lock.write();
        let inner = &mut *guard;
        let desc_loc = inner.desc_loc(ns)?;
        let desc = inner.load_desc(desc_loc)?;
        if desc.is_capped() {
            err_at!(InvalidInput, msg: "cannot compact capped {:?}", ns)?
        }
        compact_collection(inner, desc_loc, ns, ctx)?;
        inner.commit_now()?;
        Ok(())
    }

    /// Structural validation: extent chains, record counts, every index
    /// tree's invariants. Returns collected statistics.
    pub fn validate(&self, ns: &str) -> Result<Stats> {
        let guard = self.lock.read();
        let inner = &*guard;
        let desc_loc = inner.desc_loc(ns)?;
        let desc = inner.load_desc(desc_loc)?;

        let mut stats = Stats::new(&desc);
        let mut n_records = 0;
        let mut ext_loc = desc.first_extent;
        let mut prev = DiskLoc::NULL;
        while !ext_loc.is_null() {
            let ext = inner.load_extent(ext_loc)?;
            if ext.prev != prev {
                err_at!(Corruption, msg: "extent {} prev {} expected {}",
                    ext_loc, ext.prev, prev)?
            }
            n_records += catalog_records_in(inner, &ext)?;
            stats.n_extents += 1;
            prev = ext_loc;
            ext_loc = ext.next;
            if stats.n_extents > 1_000_000 {
                err_at!(Corruption, msg: "extent chain cycle in {:?}", ns)?
            }
        }
        if n_records != desc.n_records {
            err_at!(Corruption, msg: "{:?} scanned {} records, descriptor says {}",
                ns, n_records, desc.n_records)?
        }
        for meta in inner.index_metas(&desc)?.into_iter() {
            let ts = tree::validate_tree(inner, meta.head, &meta.order)?;
            stats.indexes.push((meta.name, ts));
        }
        Ok(stats)
    }

    /// Collection statistics.
    pub fn stats(&self, ns: &str) -> Result<Stats> {
        let guard = self.lock.read();
        let inner = &*guard;
        let desc_loc = inner.desc_loc(ns)?;
        let desc = inner.load_desc(desc_loc)?;
        let mut stats = Stats::new(&desc);
        let mut ext_loc = desc.first_extent;
        while !ext_loc.is_null() {
            stats.n_extents += 1;
            ext_loc = inner.load_extent(ext_loc)?.next;
        }
        Ok(stats)
    }

    /// Run `f` under the shared lock with direct access to the engine
    /// state. Test and tooling hook.
    pub fn with_inner<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&Inner) -> T,
    {
        f(&self.lock.read())
    }

    /// Run `f` under the exclusive lock with mutable engine state. Test
    /// and tooling hook.
    pub fn with_inner_mut<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut Inner) -> T,
    {
        f(&mut self.lock.write())
    }
}

/// Collection statistics in one bundle.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub name: String,
    pub n_records: u64,
    pub data_size: u64,
    pub n_extents: usize,
    pub padding: f32,
    pub capped: bool,
    pub indexes: Vec<(String, tree::TreeStats)>,
}

impl Stats {
    fn new(desc: &CollDesc) -> Stats {
        Stats {
            name: desc.name.clone(),
            n_records: desc.n_records,
            data_size: desc.data_size,
            n_extents: 0,
            padding: desc.padding,
            capped: desc.is_capped(),
            indexes: vec![],
        }
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        write!(
            f,
            concat!(
                "{{ name = {:?}, n_records = {}, data_size = {}, ",
                "n_extents = {}, padding = {:.2}, capped = {}, n_indexes = {} }}"
            ),
            self.name,
            self.n_records,
            self.data_size,
            self.n_extents,
            self.padding,
            self.capped,
            self.indexes.len(),
        )
    }
}

fn catalog_records_in(inner: &Inner, ext: &ExtentHdr) -> Result<u64> {
    use crate::loc::NULL_OFS;

    let mut n = 0;
    let mut rec_loc = ext.first_rec;
    while !rec_loc.is_null() {
        let rec = inner.load_rec(rec_loc)?;
        if rec.extent_ofs != ext.my_loc.ofs {
            err_at!(Corruption, msg: "record {} extent back-pointer", rec_loc)?
        }
        n += 1;
        rec_loc = match rec.next_ofs {
            NULL_OFS => DiskLoc::NULL,
            ofs => DiskLoc::new(rec_loc.fileno, ofs),
        };
        if n > u64::from(u32::MAX) {
            err_at!(Corruption, msg: "record chain cycle in extent {}", ext.my_loc)?
        }
    }
    Ok(n)
}

fn resolve_index(inner: &Inner, ns: &str, index_name: &str) -> Result<(DiskLoc, IndexMeta)> {
    let desc_loc = inner.desc_loc(ns)?;
    let desc = inner.load_desc(desc_loc)?;
    let metas = inner.index_metas(&desc)?;
    match metas.into_iter().find(|m| m.name == index_name) {
        Some(meta) => Ok((desc_loc, meta)),
        None => err_at!(KeyNotFound, msg: "index {:?} on {:?}", index_name, ns),
    }
}

// ---- internal write paths, called with the exclusive lock held ----

fn doc_insert(inner: &mut Inner, desc_loc: DiskLoc, doc: &Doc) -> Result<DiskLoc> {
    let payload = util::into_cbor_bytes(doc.clone())?;
    let desc = inner.load_desc(desc_loc)?;
    let metas = inner.index_metas(&desc)?;

    // compute every key first so bad documents fail before any mutation.
    let max_key = bucket::max_key_len(inner.config.bucket_size);
    let mut keysets: Vec<Vec<IndexKey>> = vec![];
    for meta in metas.iter() {
        let keys = key::keys_for_doc(&meta.order, doc)?;
        for k in keys.iter() {
            if k.len() > max_key {
                err_at!(KeyTooLarge, msg: "key of {} bytes on {:?}", k.len(), meta.name)?
            }
        }
        keysets.push(keys);
    }
    for (meta, keys) in metas.iter().zip(keysets.iter()) {
        if meta.unique {
            for k in keys.iter() {
                if tree::would_create_dup(inner, meta.head, k, DiskLoc::NULL, &meta.order)? {
                    err_at!(DuplicateKey, msg: "{:?} on {:?}", k, meta.name)?
                }
            }
        }
    }

    let loc = if desc.is_capped() {
        capped_insert_record(inner, desc_loc, &payload)?
    } else {
        inner.raw_insert(desc_loc, &payload, true)?
    };

    // index maintenance, rolled back on failure.
    let mut inserted: Vec<(usize, IndexKey)> = vec![];
    for (meta, keys) in metas.iter().zip(keysets.iter()) {
        if keys.len() >= 2 && !desc.is_multikey(meta.idx_no) {
            // the multikey bit must be durable before any of the keys.
            let mut d = inner.load_desc(desc_loc)?;
            d.set_multikey(meta.idx_no);
            inner.store_desc(desc_loc, &d)?;
        }
        for k in keys.iter() {
            let res = tree::insert(
                inner, desc_loc, meta.idx_no, k, loc, meta.unique, &meta.order,
            );
            if let Err(e) = res {
                for (idx_no, ik) in inserted.into_iter() {
                    let order = &metas[idx_no].order;
                    tree::unindex(inner, desc_loc, idx_no, &ik, loc, order)?;
                }
                alloc::free_record(inner, desc_loc, loc)?;
                return Err(e);
            }
            inserted.push((meta.idx_no, k.clone()));
        }
    }
    Ok(loc)
}

fn doc_delete(inner: &mut Inner, desc_loc: DiskLoc, loc: DiskLoc) -> Result<()> {
    if inner.load_rec(loc)?.is_deleted_slot() {
        err_at!(KeyNotFound, msg: "record {} already deleted", loc)?
    }
    // check if any cursors point to us, if so advance them.
    let registry = Arc::clone(&inner.registry);
    registry.about_to_delete(inner, loc)?;

    let doc: Doc = inner.fetch_doc(loc)?;
    unindex_record(inner, desc_loc, loc, &doc)?;
    alloc::free_record(inner, desc_loc, loc)
}

fn unindex_record(inner: &mut Inner, desc_loc: DiskLoc, loc: DiskLoc, doc: &Doc) -> Result<()> {
    let desc = inner.load_desc(desc_loc)?;
    let metas = inner.index_metas(&desc)?;
    for meta in metas.iter() {
        for k in key::keys_for_doc(&meta.order, doc)?.iter() {
            if !tree::unindex(inner, desc_loc, meta.idx_no, k, loc, &meta.order)? {
                warn!(
                    target: "store",
                    "unindex {:?} missing key for {} on {:?}", meta.name, loc, desc.name
                );
            }
        }
    }
    Ok(())
}

fn doc_update(inner: &mut Inner, desc_loc: DiskLoc, loc: DiskLoc, doc: &Doc) -> Result<DiskLoc> {
    if inner.load_rec(loc)?.is_deleted_slot() {
        err_at!(KeyNotFound, msg: "record {} already deleted", loc)?
    }
    let payload = util::into_cbor_bytes(doc.clone())?;
    let old_doc = inner.fetch_doc(loc)?;
    let desc = inner.load_desc(desc_loc)?;
    let metas = inner.index_metas(&desc)?;

    // key diff per index.
    let mut removed: Vec<Vec<IndexKey>> = vec![];
    let mut added: Vec<Vec<IndexKey>> = vec![];
    for meta in metas.iter() {
        let old_keys = key::keys_for_doc(&meta.order, &old_doc)?;
        let new_keys = key::keys_for_doc(&meta.order, doc)?;
        removed.push(old_keys.iter().filter(|k| !new_keys.contains(k)).cloned().collect());
        added.push(new_keys.iter().filter(|k| !old_keys.contains(k)).cloned().collect());
        if new_keys.len() >= 2 && !desc.is_multikey(meta.idx_no) {
            let mut d = inner.load_desc(desc_loc)?;
            d.set_multikey(meta.idx_no);
            inner.store_desc(desc_loc, &d)?;
        }
    }

    // duplicate-key pre-pass: descend once per added key so the update
    // either succeeds atomically or fails before any index is mutated.
    // two passes instead of one keeps this rollback-free.
    for (meta, adds) in metas.iter().zip(added.iter()) {
        if meta.unique {
            for k in adds.iter() {
                if tree::would_create_dup(inner, meta.head, k, loc, &meta.order)? {
                    err_at!(DuplicateKey, msg: "{:?} on {:?}", k, meta.name)?
                }
            }
        }
    }

    let hdr = inner.load_rec(loc)?;
    if u64::from(hdr.capacity()) >= payload.len() as u64 {
        // fits, overwrite in place.
        let buf = inner.write(loc.advance(REC_HDR_SIZE as u32), payload.len())?;
        buf.copy_from_slice(&payload);
        let mut desc = inner.load_desc(desc_loc)?;
        desc.padding_fits();
        inner.store_desc(desc_loc, &desc)?;

        for (meta, rems) in metas.iter().zip(removed.iter()) {
            for k in rems.iter() {
                tree::unindex(inner, desc_loc, meta.idx_no, k, loc, &meta.order)?;
            }
        }
        for (meta, adds) in metas.iter().zip(added.iter()) {
            for k in adds.iter() {
                tree::insert(inner, desc_loc, meta.idx_no, k, loc, meta.unique, &meta.order)?;
            }
        }
        Ok(loc)
    } else {
        // does not fit, reallocate.
        if desc.is_capped() {
            err_at!(CappedGrow, msg: "capped document cannot grow {}", loc)?
        }
        let mut d = inner.load_desc(desc_loc)?;
        d.padding_too_small();
        inner.store_desc(desc_loc, &d)?;

        doc_delete(inner, desc_loc, loc)?;
        let new_loc = doc_insert(inner, desc_loc, doc)?;
        debug!(target: "store", "update moved {} to {}", loc, new_loc);
        Ok(new_loc)
    }
}

// ---- capped ring ----

// oldest record in ring order, if any.
fn capped_oldest(inner: &Inner, desc_loc: DiskLoc) -> Result<Option<DiskLoc>> {
    let desc = inner.load_desc(desc_loc)?;
    let mut ext_loc = {
        // oldest extent: the one after the insertion extent once the
        // ring has wrapped, else the chain head.
        let after = ring_next(inner, &desc, desc.cap_extent)?;
        let wrapped = after != desc.cap_extent
            && !after.is_null()
            && !inner.load_extent(after)?.first_rec.is_null();
        if wrapped {
            after
        } else {
            desc.first_extent
        }
    };
    loop {
        if ext_loc.is_null() {
            return Ok(None);
        }
        let ext = inner.load_extent(ext_loc)?;
        if !ext.first_rec.is_null() {
            return Ok(Some(ext.first_rec));
        }
        if ext_loc == desc.cap_extent {
            return Ok(None);
        }
        ext_loc = ring_next(inner, &desc, ext_loc)?;
    }
}

fn ring_next(inner: &Inner, desc: &CollDesc, ext: DiskLoc) -> Result<DiskLoc> {
    let hdr = inner.load_extent(ext)?;
    if hdr.next.is_null() {
        Ok(desc.first_extent)
    } else {
        Ok(hdr.next)
    }
}

// Append-only capped insert: place at the insertion extent's tail, and
// when it is full rotate the ring, physically removing the oldest
// extent's records before reusing it.
fn capped_insert_record(inner: &mut Inner, desc_loc: DiskLoc, payload: &[u8]) -> Result<DiskLoc> {
    let len_wh =
        u32::try_from(util::align_up(REC_HDR_SIZE + payload.len(), file::ALLOC_ALIGN)).unwrap();

    // enforce the document cap first.
    loop {
        let desc = inner.load_desc(desc_loc)?;
        if desc.capped_max_docs == 0 || desc.n_records < desc.capped_max_docs {
            break;
        }
        match capped_oldest(inner, desc_loc)? {
            Some(old) => doc_delete(inner, desc_loc, old)?,
            None => break,
        }
    }
    // and the byte cap.
    loop {
        let desc = inner.load_desc(desc_loc)?;
        let net = u64::from(len_wh) - REC_HDR_SIZE as u64;
        if desc.data_size + net <= desc.capped_max_bytes {
            break;
        }
        match capped_oldest(inner, desc_loc)? {
            Some(old) => doc_delete(inner, desc_loc, old)?,
            None => err_at!(
                CappedOverflow, msg: "document of {} bytes exceeds cap", payload.len()
            )?,
        }
    }

    let n_extents = {
        let desc = inner.load_desc(desc_loc)?;
        let mut n = 0;
        let mut l = desc.first_extent;
        while !l.is_null() {
            n += 1;
            l = inner.load_extent(l)?.next;
        }
        n
    };

    let mut rotations = 0;
    loop {
        let desc = inner.load_desc(desc_loc)?;
        let ext = inner.load_extent(desc.cap_extent)?;
        let append = match ext.last_rec {
            last if last.is_null() => ext.data_loc(),
            last => {
                let hdr = inner.load_rec(last)?;
                let end = last.ofs + hdr.len_with_hdr;
                DiskLoc::new(
                    last.fileno,
                    u32::try_from(util::align_up(end as usize, file::ALLOC_ALIGN)).unwrap(),
                )
            }
        };
        let ext_end = ext.my_loc.ofs + ext.length;
        if append.ofs + len_wh <= ext_end {
            let hdr = RecHdr::new(len_wh, ext.my_loc.ofs);
            inner.store_rec(append, &hdr)?;
            alloc::link_record(inner, append)?;
            let buf = inner.write(append.advance(REC_HDR_SIZE as u32), payload.len())?;
            buf.copy_from_slice(payload);
            let mut desc = inner.load_desc(desc_loc)?;
            desc.n_records += 1;
            desc.data_size += u64::from(len_wh) - REC_HDR_SIZE as u64;
            inner.store_desc(desc_loc, &desc)?;
            return Ok(append);
        }

        if rotations > n_extents {
            err_at!(CappedOverflow, msg: "document of {} bytes too big for ring", payload.len())?
        }
        // rotate: clear the next extent in the ring, the oldest data,
        // and make it the insertion extent.
        let victim = ring_next(inner, &desc, desc.cap_extent)?;
        loop {
            let first = inner.load_extent(victim)?.first_rec;
            if first.is_null() {
                break;
            }
            doc_delete(inner, desc_loc, first)?;
        }
        let mut desc = inner.load_desc(desc_loc)?;
        desc.cap_extent = victim;
        inner.store_desc(desc_loc, &desc)?;
        rotations += 1;
    }
}

// ---- index build / compaction ----

#[allow(clippy::too_many_arguments)]
fn build_index(
    inner: &mut Inner,
    desc_loc: DiskLoc,
    ns: &str,
    index_name: &str,
    order_spec: &Doc,
    unique: bool,
    drop_dups: bool,
    ctx: &Opctx,
) -> Result<()> {
    let order = KeyOrder::from_doc(order_spec)?;
    let desc = inner.load_desc(desc_loc)?;
    if inner.index_metas(&desc)?.iter().any(|m| m.name == index_name) {
        err_at!(InvalidInput, msg: "index {:?} exists on {:?}", index_name, ns)?
    }

    // the index descriptor record goes in first, head still null.
    let info = IndexInfo {
        name: index_name.to_string(),
        order: order.to_doc(),
        unique,
        drop_dups,
        spec: order_spec.clone(),
    };
    let idx_desc_loc = inner.desc_loc(INDEXES_NS)?;
    let info_loc = inner.raw_insert(idx_desc_loc, &util::into_cbor_bytes(info)?, false)?;
    let idx_no = {
        let mut desc = inner.load_desc(desc_loc)?;
        let idx_no = desc.add_index(info_loc, DiskLoc::NULL)?;
        inner.store_desc(desc_loc, &desc)?;
        idx_no
    };

    info!(target: "store", "building index {:?} on {:?}", index_name, ns);
    match feed_and_build(inner, desc_loc, idx_no, &order, unique, drop_dups, ctx) {
        Ok(()) => Ok(()),
        Err(e) => {
            // abort: detach the slot and the descriptor record; the
            // head was never attached.
            let mut desc = inner.load_desc(desc_loc)?;
            desc.remove_index(idx_no);
            inner.store_desc(desc_loc, &desc)?;
            alloc::free_record(inner, idx_desc_loc, info_loc)?;
            warn!(target: "store", "index build {:?} on {:?} failed: {}", index_name, ns, e);
            Err(e)
        }
    }
}

fn feed_and_build(
    inner: &mut Inner,
    desc_loc: DiskLoc,
    idx_no: usize,
    order: &KeyOrder,
    unique: bool,
    drop_dups: bool,
    ctx: &Opctx,
) -> Result<()> {
    let dir = path::PathBuf::from(&inner.config.dir);
    let desc = inner.load_desc(desc_loc)?;
    let sort_name = format!("{}.{}", desc.name, idx_no);
    let mut sorter =
        ExtSorter::new(&dir, &sort_name, order.clone(), inner.config.sort_budget);

    let mut multikey = false;
    for loc in catalog::each_record(inner, &desc)?.into_iter() {
        ctx.check_interrupt()?;
        let doc = inner.fetch_doc(loc)?;
        let keys = key::keys_for_doc(order, &doc)?;
        if keys.len() >= 2 {
            multikey = true;
        }
        for k in keys.into_iter() {
            sorter.add(k, loc, ctx)?;
        }
    }

    if multikey {
        let mut desc = inner.load_desc(desc_loc)?;
        desc.set_multikey(idx_no);
        inner.store_desc(desc_loc, &desc)?;
    }

    let mut builder =
        TreeBuilder::new(inner.config.bucket_size, order.clone(), !unique, drop_dups);
    let mut n = 0_u64;
    for item in sorter.done(ctx)? {
        let (k, loc) = item?;
        n += 1;
        if n % 4096 == 0 {
            if let Err(e) = ctx.check_interrupt() {
                builder.abort(inner)?;
                return Err(e);
            }
        }
        if let Err(e) = builder.add_key(inner, &k, loc) {
            builder.abort(inner)?;
            return Err(e);
        }
    }
    let (root, dup_drops, n_keys) = builder.commit(inner)?;

    let mut desc = inner.load_desc(desc_loc)?;
    desc.indexes[idx_no].head = root;
    inner.store_desc(desc_loc, &desc)?;
    debug!(target: "store", "bulk built {} keys, {} dup drops", n_keys, dup_drops.len());

    for loc in dup_drops.into_iter() {
        doc_delete(inner, desc_loc, loc)?;
    }
    Ok(())
}

// Rebuild the whole collection tightly: records are copied into fresh
// extents with padding 1.0, each emptied extent goes to the free list,
// and every index is rebuilt bottom-up from the external sorter.
fn compact_collection(inner: &mut Inner, desc_loc: DiskLoc, ns: &str, ctx: &Opctx) -> Result<()> {
    let registry = Arc::clone(&inner.registry);
    registry.invalidate_ns(desc_loc);

    let desc = inner.load_desc(desc_loc)?;
    let metas = inner.index_metas(&desc)?;

    // detach the index trees; heads stay null while records move.
    for meta in metas.iter() {
        tree::free_tree(inner, meta.head)?;
    }
    {
        let mut d = inner.load_desc(desc_loc)?;
        for meta in metas.iter() {
            d.indexes[meta.idx_no].head = DiskLoc::NULL;
        }
        // the old chain is now tracked locally; reset the collection to
        // an empty chain so re-inserts build the compacted one.
        d.first_extent = DiskLoc::NULL;
        d.last_extent = DiskLoc::NULL;
        d.last_extent_size = 0;
        d.n_records = 0;
        d.data_size = 0;
        d.padding = 1.0;
        d.deleted = [DiskLoc::NULL; desc::N_DELETED];
        inner.store_desc(desc_loc, &d)?;
    }

    let dir = path::PathBuf::from(&inner.config.dir);
    let mut sorters: Vec<ExtSorter> = metas
        .iter()
        .map(|m| {
            let name = format!("{}.compact.{}", ns, m.idx_no);
            ExtSorter::new(&dir, &name, m.order.clone(), inner.config.sort_budget)
        })
        .collect();

    let mut old_ext = desc.first_extent;
    let mut interrupted = None;
    let mut n_moved = 0_u64;
    while !old_ext.is_null() {
        if let Err(e) = ctx.check_interrupt() {
            interrupted = Some(e);
            break;
        }
        let ext = inner.load_extent(old_ext)?;
        let next_ext = ext.next;

        let mut rec_loc = ext.first_rec;
        while !rec_loc.is_null() {
            let rec = inner.load_rec(rec_loc)?;
            let next = match rec.next_ofs {
                crate::loc::NULL_OFS => DiskLoc::NULL,
                ofs => DiskLoc::new(rec_loc.fileno, ofs),
            };
            let payload = inner.rec_payload(rec_loc)?.to_vec();
            let new_loc = inner.raw_insert(desc_loc, &payload, false)?;
            let doc: Doc = util::from_cbor_bytes(&payload)?.0;
            for (meta, sorter) in metas.iter().zip(sorters.iter_mut()) {
                for k in key::keys_for_doc(&meta.order, &doc)?.into_iter() {
                    sorter.add(k, new_loc, ctx)?;
                }
            }
            n_moved += 1;
            rec_loc = next;
        }

        // the emptied extent goes straight to the free pool.
        let mut ext = inner.load_extent(old_ext)?;
        ext.prev = DiskLoc::NULL;
        ext.next = DiskLoc::NULL;
        ext.first_rec = DiskLoc::NULL;
        ext.last_rec = DiskLoc::NULL;
        inner.store_extent(&ext)?;
        freelist::give_to_freelist(inner, old_ext, old_ext)?;

        old_ext = next_ext;
    }

    if interrupted.is_some() && !old_ext.is_null() {
        // splice the unprocessed tail of the old chain back onto the
        // collection so no record is lost.
        let remaining_first = old_ext;
        let mut remaining_last = old_ext;
        loop {
            let ext = inner.load_extent(remaining_last)?;
            if ext.next.is_null() {
                break;
            }
            remaining_last = ext.next;
        }
        let mut d = inner.load_desc(desc_loc)?;
        let mut head = inner.load_extent(remaining_first)?;
        head.prev = d.last_extent;
        inner.store_extent(&head)?;
        if d.last_extent.is_null() {
            d.first_extent = remaining_first;
        } else {
            let mut tail = inner.load_extent(d.last_extent)?;
            tail.next = remaining_first;
            inner.store_extent(&tail)?;
        }
        d.last_extent = remaining_last;
        let tail_hdr = inner.load_extent(remaining_last)?;
        d.last_extent_size = tail_hdr.length;
        // counters for the unmoved records.
        let mut ext_loc = remaining_first;
        while !ext_loc.is_null() {
            let ext = inner.load_extent(ext_loc)?;
            d.n_records += catalog_records_in(inner, &ext)?;
            let mut rec_loc = ext.first_rec;
            while !rec_loc.is_null() {
                let rec = inner.load_rec(rec_loc)?;
                d.data_size += u64::from(rec.capacity());
                rec_loc = match rec.next_ofs {
                    crate::loc::NULL_OFS => DiskLoc::NULL,
                    ofs => DiskLoc::new(rec_loc.fileno, ofs),
                };
            }
            ext_loc = ext.next;
        }
        inner.store_desc(desc_loc, &d)?;
    }

    match interrupted {
        None => {
            // rebuild every index from its sorter.
            for (meta, sorter) in metas.iter().zip(sorters.into_iter()) {
                rebuild_index_from(inner, desc_loc, meta, sorter, ctx)?;
            }
            info!(target: "store", "compacted {:?}, {} records", ns, n_moved);
            Ok(())
        }
        Some(e) => {
            // indexes must cover the whole surviving set: rebuild from a
            // fresh table scan.
            drop(sorters);
            for meta in metas.iter() {
                let desc = inner.load_desc(desc_loc)?;
                let name = format!("{}.recover.{}", ns, meta.idx_no);
                let recover_ctx = Opctx::new();
                let mut sorter =
                    ExtSorter::new(&dir, &name, meta.order.clone(), inner.config.sort_budget);
                for loc in catalog::each_record(inner, &desc)?.into_iter() {
                    let doc = inner.fetch_doc(loc)?;
                    for k in key::keys_for_doc(&meta.order, &doc)?.into_iter() {
                        sorter.add(k, loc, &recover_ctx)?;
                    }
                }
                rebuild_index_from(inner, desc_loc, meta, sorter, &recover_ctx)?;
            }
            warn!(target: "store", "compact of {:?} interrupted after {} records", ns, n_moved);
            Err(e)
        }
    }
}

fn rebuild_index_from(
    inner: &mut Inner,
    desc_loc: DiskLoc,
    meta: &IndexMeta,
    sorter: ExtSorter,
    ctx: &Opctx,
) -> Result<()> {
    let mut builder = TreeBuilder::new(
        inner.config.bucket_size,
        meta.order.clone(),
        !meta.unique,
        meta.drop_dups,
    );
    for item in sorter.done(ctx)? {
        let (k, loc) = item?;
        builder.add_key(inner, &k, loc)?;
    }
    let (root, dup_drops, _) = builder.commit(inner)?;
    let mut desc = inner.load_desc(desc_loc)?;
    desc.indexes[meta.idx_no].head = root;
    inner.store_desc(desc_loc, &desc)?;
    for loc in dup_drops.into_iter() {
        doc_delete(inner, desc_loc, loc)?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
