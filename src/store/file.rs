//! Module `file` implement the memory-mapped data files.
//!
//! A store is a sequence of fixed-size files `<name>.0`, `<name>.1`, ...
//! each mapped read-write for its whole life. The first 64 bytes of every
//! file is the [FileHeader]; the remainder is carved into extents and
//! bucket pages from a contiguous unused tail that only ever shrinks.
//! File 0 additionally anchors the catalog -- the descriptor record of
//! `system.namespaces` -- and the head of the bucket-page free list.

use fs2::FileExt;
use memmap::MmapMut;

use std::{convert::TryFrom, fs, path};

use crate::{
    loc::{DiskLoc, NULL_OFS},
    store::config::Config,
    util, Error, Result,
};

/// Magic at offset 0 of every data file.
pub const FILE_MAGIC: u32 = 0x4453_5452;
/// On-disk format version.
pub const FILE_VERSION: u32 = 1;
/// Bytes reserved for the file header.
pub const FILE_HDR_SIZE: usize = 64;

/// Alignment for extents, records and bucket pages. Keeps record offsets
/// even, which the B-tree's tagged locators depend on.
pub const ALLOC_ALIGN: usize = 8;

/// Decoded file header. Mutations go through [DataFile::store_header].
#[derive(Clone, Debug)]
pub struct FileHeader {
    pub fileno: u32,
    pub length: u64,
    pub unused_ofs: u32,
    pub unused_len: u32,
    /// File 0 only: descriptor record of `system.namespaces`.
    pub catalog: DiskLoc,
    /// File 0 only: head of the freed bucket-page list.
    pub bucket_free: DiskLoc,
    /// File 0 only: bucket size the store's trees were built with.
    pub bucket_size: u32,
}

impl FileHeader {
    fn new(fileno: u32, length: u64) -> FileHeader {
        let unused_ofs = u32::try_from(FILE_HDR_SIZE).unwrap();
        let unused_len = u32::try_from(length).unwrap() - unused_ofs;
        FileHeader {
            fileno,
            length,
            unused_ofs,
            unused_len,
            catalog: DiskLoc::NULL,
            bucket_free: DiskLoc::NULL,
            bucket_size: 0,
        }
    }

    fn load(buf: &[u8]) -> Result<FileHeader> {
        use std::convert::TryInto;

        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != FILE_MAGIC {
            err_at!(Corruption, msg: "file magic {:#x}", magic)?
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != FILE_VERSION {
            err_at!(InvalidFile, msg: "file version {}", version)?
        }
        Ok(FileHeader {
            fileno: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            length: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            unused_ofs: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            unused_len: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            catalog: DiskLoc::from_bytes(&buf[32..40])?,
            bucket_free: DiskLoc::from_bytes(&buf[40..48])?,
            bucket_size: u32::from_le_bytes(buf[48..52].try_into().unwrap()),
        })
    }

    fn store(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&FILE_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.fileno.to_le_bytes());
        buf[12..16].copy_from_slice(&0_u32.to_le_bytes());
        buf[16..24].copy_from_slice(&self.length.to_le_bytes());
        buf[24..28].copy_from_slice(&self.unused_ofs.to_le_bytes());
        buf[28..32].copy_from_slice(&self.unused_len.to_le_bytes());
        buf[32..40].copy_from_slice(&self.catalog.to_bytes());
        buf[40..48].copy_from_slice(&self.bucket_free.to_bytes());
        buf[48..52].copy_from_slice(&self.bucket_size.to_le_bytes());
        for b in buf[52..FILE_HDR_SIZE].iter_mut() {
            *b = 0;
        }
    }
}

/// One mapped data file.
pub struct DataFile {
    fileno: u32,
    path: path::PathBuf,
    fd: fs::File,
    map: MmapMut,
    length: u64,
}

impl Drop for DataFile {
    fn drop(&mut self) {
        self.map.flush().ok();
        if let Err(err) = self.fd.unlock() {
            panic!("fail to unlock data file {:?}: {}", self.path, err)
        }
    }
}

impl DataFile {
    /// Create and map a fresh data file through the preallocator.
    pub fn create(path: &path::Path, fileno: u32, length: u64, fd: fs::File) -> Result<DataFile> {
        err_at!(IOError, fd.try_lock_exclusive(), "lock {:?}", path)?;
        let mut map = err_at!(IOError, unsafe { MmapMut::map_mut(&fd) })?;

        let header = FileHeader::new(fileno, length);
        header.store(&mut map[..FILE_HDR_SIZE]);

        let val = DataFile { fileno, path: path.to_path_buf(), fd, map, length };
        Ok(val)
    }

    /// Map an existing data file and validate its header.
    pub fn open(path: &path::Path, fileno: u32) -> Result<DataFile> {
        let fd = util::open_file_rw(path.as_os_str())?;
        err_at!(IOError, fd.try_lock_exclusive(), "lock {:?}", path)?;
        let length = err_at!(IOError, fd.metadata())?.len();
        let map = err_at!(IOError, unsafe { MmapMut::map_mut(&fd) })?;

        let val = DataFile { fileno, path: path.to_path_buf(), fd, map, length };
        let header = val.load_header()?;
        if header.fileno != fileno {
            err_at!(Corruption, msg: "fileno {} expected {}", header.fileno, fileno)?
        }
        if header.length != length {
            err_at!(Corruption, msg: "length {} expected {}", header.length, length)?
        }
        Ok(val)
    }

    pub fn load_header(&self) -> Result<FileHeader> {
        FileHeader::load(&self.map[..FILE_HDR_SIZE])
    }

    pub fn store_header(&mut self, header: &FileHeader) {
        header.store(&mut self.map[..FILE_HDR_SIZE]);
    }

    pub fn to_length(&self) -> u64 {
        self.length
    }

    pub fn flush_range(&self, ofs: usize, len: usize) -> Result<()> {
        err_at!(IOError, self.map.flush_range(ofs, len), "flush {:?}", self.path)
    }

    pub fn flush(&self) -> Result<()> {
        err_at!(IOError, self.map.flush(), "flush {:?}", self.path)
    }
}

/// The arena: every on-disk structure is reached by dereferencing a
/// [DiskLoc] through this set of maps.
pub struct Files {
    files: Vec<DataFile>,
}

impl Files {
    pub fn new() -> Files {
        Files { files: Vec::default() }
    }

    pub fn push(&mut self, file: DataFile) {
        debug_assert!(file.fileno as usize == self.files.len());
        self.files.push(file);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Open `<name>.0` .. `<name>.<n>` from `config`'s directory.
    pub fn open(config: &Config) -> Result<Files> {
        let mut files = Files::new();
        loop {
            let fileno = u32::try_from(files.len()).unwrap();
            let path = config.file_path(fileno);
            if !path.exists() {
                break;
            }
            files.push(DataFile::open(&path, fileno)?);
        }
        if files.is_empty() {
            err_at!(InvalidFile, msg: "no data files for {:?}", config.name)?
        }
        Ok(files)
    }

    pub fn file(&self, fileno: u32) -> Result<&DataFile> {
        match self.files.get(fileno as usize) {
            Some(file) => Ok(file),
            None => err_at!(Corruption, msg: "no data file {}", fileno),
        }
    }

    pub fn file_mut(&mut self, fileno: u32) -> Result<&mut DataFile> {
        match self.files.get_mut(fileno as usize) {
            Some(file) => Ok(file),
            None => err_at!(Corruption, msg: "no data file {}", fileno),
        }
    }

    /// Immutable bytes at `loc`.
    pub fn read(&self, loc: DiskLoc, len: usize) -> Result<&[u8]> {
        let file = self.bounds_check(loc, len)?;
        let start = loc.ofs as usize;
        Ok(&file.map[start..start + len])
    }

    /// Mutable bytes at `loc`. Callers route through the store so the
    /// durability collaborator sees the range first.
    pub fn slice_mut(&mut self, loc: DiskLoc, len: usize) -> Result<&mut [u8]> {
        self.bounds_check(loc, len)?;
        let file = self.files.get_mut(loc.fileno as usize).unwrap();
        let start = loc.ofs as usize;
        Ok(&mut file.map[start..start + len])
    }

    pub fn flush_range(&self, loc: DiskLoc, len: usize) -> Result<()> {
        let file = self.bounds_check(loc, len)?;
        file.flush_range(loc.ofs as usize, len)
    }

    pub fn flush_all(&self) -> Result<()> {
        for file in self.files.iter() {
            file.flush()?;
        }
        Ok(())
    }

    fn bounds_check(&self, loc: DiskLoc, len: usize) -> Result<&DataFile> {
        if loc.is_null() || loc.ofs == NULL_OFS {
            err_at!(Fatal, msg: "dereference null locator")?
        }
        let file = self.file(loc.fileno)?;
        let end = loc.ofs as u64 + len as u64;
        if end > file.length {
            err_at!(Corruption, msg: "loc {} + {} beyond file end", loc, len)?
        }
        Ok(file)
    }
}

#[cfg(test)]
#[path = "file_test.rs"]
mod file_test;
