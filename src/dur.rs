//! Module `dur` define the durability and preallocation collaborators.
//!
//! The engine never writes to a mapped page without first declaring the
//! range through [Durability::note_write]. A successful `commit_now` --
//! driven by the owning store, which flushes the drained ranges through its
//! maps -- means the declared mutations survive a process crash; nothing
//! stronger is assumed about fsync timing.
//!
//! [Prealloc] grows the database by whole files; the engine proceeds once a
//! mapping over the returned file descriptor is valid.

use std::{fs, path};

use crate::{loc::DiskLoc, Error, Result};

/// Write-ahead contract between the engine and its journal.
pub trait Durability {
    /// Declare that `len` bytes at `loc` are about to change.
    fn note_write(&mut self, loc: DiskLoc, len: u32);

    /// Bytes declared since the last commit.
    fn pending_bytes(&self) -> u64;

    /// True when the pending volume crossed the configured threshold and
    /// the store should drive a commit.
    fn should_commit(&self) -> bool;

    /// Hand the dirty ranges to the store for flushing and reset.
    fn take_dirty(&mut self) -> Vec<(DiskLoc, u32)>;
}

/// Default durability collaborator: remembers dirty ranges and asks for a
/// commit once `threshold` bytes are pending.
pub struct DirtyLog {
    threshold: u64,
    pending: u64,
    ranges: Vec<(DiskLoc, u32)>,
}

impl DirtyLog {
    pub fn new(threshold: u64) -> DirtyLog {
        DirtyLog { threshold, pending: 0, ranges: Vec::default() }
    }
}

impl Durability for DirtyLog {
    fn note_write(&mut self, loc: DiskLoc, len: u32) {
        self.pending += u64::from(len);
        self.ranges.push((loc, len));
    }

    fn pending_bytes(&self) -> u64 {
        self.pending
    }

    fn should_commit(&self) -> bool {
        self.pending >= self.threshold
    }

    fn take_dirty(&mut self) -> Vec<(DiskLoc, u32)> {
        self.pending = 0;
        std::mem::take(&mut self.ranges)
    }
}

/// Durability collaborator that journals nothing. Tests and throw-away
/// stores use this.
#[derive(Default)]
pub struct NoDur;

impl Durability for NoDur {
    fn note_write(&mut self, _loc: DiskLoc, _len: u32) {}

    fn pending_bytes(&self) -> u64 {
        0
    }

    fn should_commit(&self) -> bool {
        false
    }

    fn take_dirty(&mut self) -> Vec<(DiskLoc, u32)> {
        Vec::default()
    }
}

/// File grower. The default implementation allocates synchronously; an
/// asynchronous implementation can overlap allocation with foreground work
/// as long as `request` returns an openable file.
pub trait Prealloc {
    fn request(&mut self, path: &path::Path, size: u64) -> Result<fs::File>;
}

/// Synchronous preallocator, creates the file and extends it to `size`.
#[derive(Default)]
pub struct SyncPrealloc;

impl Prealloc for SyncPrealloc {
    fn request(&mut self, path: &path::Path, size: u64) -> Result<fs::File> {
        let mut opts = fs::OpenOptions::new();
        let fd = err_at!(
            IOError,
            opts.read(true).write(true).create(true).open(path),
            "prealloc {:?}",
            path
        )?;
        err_at!(IOError, fd.set_len(size), "prealloc set_len {:?}", path)?;
        Ok(fd)
    }
}
