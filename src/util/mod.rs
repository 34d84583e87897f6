//! Module implement common utility functions and types.

use cbordata::{Cbor, FromCbor, IntoCbor};

use std::{ffi, fs, path};

use crate::{Error, Result};

pub mod spinlock;

pub use spinlock::Spinlock;

/// Helper function to serialize value `T` implementing IntoCbor, into byte-string.
pub fn into_cbor_bytes<T>(val: T) -> Result<Vec<u8>>
where
    T: IntoCbor,
{
    let mut data: Vec<u8> = vec![];
    let n = err_at!(
        FailCbor,
        err_at!(FailCbor, val.into_cbor())?.encode(&mut data)
    )?;
    if n != data.len() {
        err_at!(Fatal, msg: "cbor encoding len mismatch {} {}", n, data.len())?
    }
    Ok(data)
}

/// Helper function to deserialize value `T` implementing FromCbor, from byte-string.
pub fn from_cbor_bytes<T>(mut buf: &[u8]) -> Result<(T, usize)>
where
    T: FromCbor,
{
    let (val, n) = err_at!(FailCbor, Cbor::decode(&mut buf))?;
    Ok((err_at!(FailCbor, T::from_cbor(val))?, n))
}

/// Create a file of `len` bytes for read-write access, deleting any file
/// of the same name. Parent directories are created as required.
pub fn create_file_rw(file: &ffi::OsStr, len: u64) -> Result<fs::File> {
    let os_file = {
        let os_file = path::Path::new(file);
        fs::remove_file(os_file).ok(); // NOTE: ignore remove errors.
        os_file
    };

    {
        let parent = match os_file.parent() {
            Some(parent) => Ok(parent),
            None => err_at!(InvalidFile, msg: "{:?}", file),
        }?;
        err_at!(IOError, fs::create_dir_all(parent))?;
    };

    let mut opts = fs::OpenOptions::new();
    let fd = err_at!(
        IOError,
        opts.read(true).write(true).create_new(true).open(os_file)
    )?;
    err_at!(IOError, fd.set_len(len), "set_len {:?}", file)?;
    Ok(fd)
}

/// Open an existing file for read-write access.
pub fn open_file_rw(file: &ffi::OsStr) -> Result<fs::File> {
    let os_file = path::Path::new(file);
    let mut opts = fs::OpenOptions::new();
    Ok(err_at!(IOError, opts.read(true).write(true).open(os_file))?)
}

/// Open file for reading.
pub fn open_file_r(file: &ffi::OsStr) -> Result<fs::File> {
    let os_file = path::Path::new(file);
    Ok(err_at!(
        IOError,
        fs::OpenOptions::new().read(true).open(os_file)
    )?)
}

/// Quantize `n` up to the next multiple of `q`. `q` must be a power of 2.
pub fn align_up(n: usize, q: usize) -> usize {
    debug_assert!(q.is_power_of_two());
    (n + q - 1) & !(q - 1)
}
