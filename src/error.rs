//! Module `error` define the error type for the entire package.
//!
//! Constructing errors by hand gets tedious, use the [err_at] macro to
//! compose an [Error] value along with its `file:line` prefix. Three forms,
//!
//! ```ignore
//! err_at!(StorageFull, msg: "no extent for {} bytes", n);
//! err_at!(IOError, fd.sync_all());
//! err_at!(IOError, fd.sync_all(), "while closing {:?}", loc);
//! ```

use std::{error, fmt, result};

/// Short form to compose Error values.
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

/// Type alias for Result returns of this package's functions and methods.
pub type Result<T> = result::Result<T, Error>;

/// Error variants used across the package.
///
/// Every variant carries a `file:line` prefix and a human readable message.
/// The first few variants are operational outcomes a caller is expected to
/// handle; the rest indicate bad input, broken files or internal failure.
#[derive(Clone, PartialEq)]
pub enum Error {
    /// No extent can be allocated in any data file.
    StorageFull(String, String),
    /// Insert into a capped collection that cannot make room.
    CappedOverflow(String, String),
    /// Update would grow a record inside a capped collection.
    CappedGrow(String, String),
    /// Unique index saw an equal key from a different record.
    DuplicateKey(String, String),
    /// Key exceeds the per-bucket cap.
    KeyTooLarge(String, String),
    /// Cooperative cancellation fired.
    Interrupted(String, String),
    /// Magic mismatch, chain cycle, bucket invariant violation.
    Corruption(String, String),
    /// Programming error surfaced on a release build.
    Fatal(String, String),
    IOError(String, String),
    FailConvert(String, String),
    FailCbor(String, String),
    InvalidInput(String, String),
    InvalidFile(String, String),
    KeyNotFound(String, String),
    NsNotFound(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            StorageFull(p, m) => write!(f, "StorageFull:{} {}", p, m),
            CappedOverflow(p, m) => write!(f, "CappedOverflow:{} {}", p, m),
            CappedGrow(p, m) => write!(f, "CappedGrow:{} {}", p, m),
            DuplicateKey(p, m) => write!(f, "DuplicateKey:{} {}", p, m),
            KeyTooLarge(p, m) => write!(f, "KeyTooLarge:{} {}", p, m),
            Interrupted(p, m) => write!(f, "Interrupted:{} {}", p, m),
            Corruption(p, m) => write!(f, "Corruption:{} {}", p, m),
            Fatal(p, m) => write!(f, "Fatal:{} {}", p, m),
            IOError(p, m) => write!(f, "IOError:{} {}", p, m),
            FailConvert(p, m) => write!(f, "FailConvert:{} {}", p, m),
            FailCbor(p, m) => write!(f, "FailCbor:{} {}", p, m),
            InvalidInput(p, m) => write!(f, "InvalidInput:{} {}", p, m),
            InvalidFile(p, m) => write!(f, "InvalidFile:{} {}", p, m),
            KeyNotFound(p, m) => write!(f, "KeyNotFound:{} {}", p, m),
            NsNotFound(p, m) => write!(f, "NsNotFound:{} {}", p, m),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}
