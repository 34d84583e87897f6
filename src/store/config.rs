//! Configuration for a [Store][crate::store::Store] instance.

use std::{ffi, path};

use crate::sort::SORT_BUDGET;

/// Default size for the first data file, 64 MiB. Subsequent files double
/// up to [FILE_SIZE_MAX].
pub const FILE_SIZE_INIT: u64 = 64 * 1024 * 1024;
/// Largest data file, 2 GiB on 64-bit builds.
pub const FILE_SIZE_MAX: u64 = 2 * 1024 * 1024 * 1024;
/// Default B-tree bucket size, 8 KiB.
pub const BUCKET_SIZE: usize = 8 * 1024;
/// Default pause when the global lock is yielded inside a long operation.
pub const YIELD_MICROS: u64 = 200;
/// Default pending-byte threshold for `commit_if_needed`.
pub const COMMIT_BYTES: u64 = 100 * 1024 * 1024;

/// Configuration for a store. Created with [Config::new], refined with the
/// `set_*` methods, consumed by `Store::create`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory in which the store's data files live.
    pub dir: ffi::OsString,
    /// Name of the store, data files are named `<name>.<n>`.
    pub name: String,
    /// Size of the first data file.
    ///
    /// Default: [FILE_SIZE_INIT]
    pub file_size_init: u64,
    /// Ceiling for data file sizes; files double from `file_size_init`
    /// until they reach it.
    ///
    /// Default: [FILE_SIZE_MAX]
    pub file_size_max: u64,
    /// B-tree bucket size. Also bounds the largest accepted key at a
    /// quarter of this, less the slot overhead.
    ///
    /// Default: [BUCKET_SIZE]
    pub bucket_size: usize,
    /// In-memory budget for the external sorter.
    ///
    /// Default: [crate::sort::SORT_BUDGET]
    pub sort_budget: usize,
    /// Pause applied when a long operation yields the global lock.
    ///
    /// Default: [YIELD_MICROS]
    pub yield_micros: u64,
    /// Pending mutation volume beyond which `commit_if_needed` flushes.
    ///
    /// Default: [COMMIT_BYTES]
    pub commit_bytes: u64,
}

impl Config {
    pub fn new(dir: &ffi::OsStr, name: &str) -> Config {
        Config {
            dir: dir.to_os_string(),
            name: name.to_string(),
            file_size_init: FILE_SIZE_INIT,
            file_size_max: FILE_SIZE_MAX,
            bucket_size: BUCKET_SIZE,
            sort_budget: SORT_BUDGET,
            yield_micros: YIELD_MICROS,
            commit_bytes: COMMIT_BYTES,
        }
    }

    /// Configure data file sizing, `init` doubling up to `max`.
    pub fn set_file_size(&mut self, init: u64, max: u64) -> &mut Self {
        self.file_size_init = init;
        self.file_size_max = max;
        self
    }

    /// Configure the B-tree bucket size, must be a power of two.
    pub fn set_bucket_size(&mut self, size: usize) -> &mut Self {
        self.bucket_size = size;
        self
    }

    /// Configure the external sorter's in-memory budget.
    pub fn set_sort_budget(&mut self, budget: usize) -> &mut Self {
        self.sort_budget = budget;
        self
    }

    /// Configure the yield pause, in microseconds.
    pub fn set_yield_micros(&mut self, micros: u64) -> &mut Self {
        self.yield_micros = micros;
        self
    }

    /// Configure the commit threshold, in bytes.
    pub fn set_commit_bytes(&mut self, bytes: u64) -> &mut Self {
        self.commit_bytes = bytes;
        self
    }

    /// Size for data file number `fileno` under the doubling schedule.
    pub fn file_size(&self, fileno: u32) -> u64 {
        let mut size = self.file_size_init;
        for _ in 0..fileno {
            size = std::cmp::min(size.saturating_mul(2), self.file_size_max);
        }
        size
    }

    /// Path of data file number `fileno`.
    pub fn file_path(&self, fileno: u32) -> path::PathBuf {
        let file_name = format!("{}.{}", self.name, fileno);
        [path::PathBuf::from(&self.dir), file_name.into()].iter().collect()
    }
}
