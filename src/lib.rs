//! Package implement an on-disk indexed record engine for document
//! databases.
//!
//! Documents are stored as variable-length self-describing records in
//! memory-mapped append-structured extents; ordered secondary access goes
//! through disk-resident B-trees whose comparison key is the composite
//! key plus the owning record's disk address. One [Store] is one
//! database:
//!
//! ```ignore
//! let mut config = Config::new(dir, "events");
//! let store = Store::create(config)?;
//! let ctx = Opctx::new();
//! store.create_collection("events", CollOpts::default(), &ctx)?;
//! let loc = store.insert("events", &Doc::new().set("x", 7), &ctx)?;
//! store.create_index("events", "x_1", &Doc::new().set("x", 1), false, false, &ctx)?;
//! let mut cur = store.index_scan("events", "x_1", 1, None, None, true)?;
//! while let Some((loc, doc)) = store.cursor_next(&mut cur, &ctx)? { /* .. */ }
//! ```
//!
//! **Concurrency.** Every operation runs under the store's global
//! readers-writer lock ([lock::GlobalLock]): reads shared, mutations
//! exclusive, a single total order of mutations. Long operations yield
//! the lock at explicit points; cursors snapshot their position and
//! re-validate on resume. The cursor registry's spinlock sits below the
//! global lock and is never held across a cursor operation.
//!
//! **Durability.** Every mutation is declared to the
//! [dur::Durability] collaborator before the mapped page is touched;
//! `commit_now` flushes the declared ranges. Nothing stronger than that
//! contract is assumed.

#[macro_use]
pub mod error;

pub mod btree;
pub mod ctx;
pub mod cursor;
pub mod doc;
pub mod dur;
pub mod lock;
pub mod loc;
pub mod sort;
pub mod store;
pub mod util;

pub use crate::btree::{IndexKey, KeyOrder};
pub use crate::ctx::Opctx;
pub use crate::cursor::{Cursor, Interval};
pub use crate::doc::{Doc, Value};
pub use crate::error::{Error, Result};
pub use crate::loc::{DiskLoc, RecRef};
pub use crate::store::{CollOpts, Config, Stats, Store};
