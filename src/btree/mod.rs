//! Package implement the disk-resident B-tree index.
//!
//! [key] encodes composite keys under a per-field ordering vector;
//! [bucket] is the page format; [tree] the insert/unindex/traversal
//! engine; [build] the bottom-up bulk builder fed by the external sorter.

pub mod bucket;
pub mod build;
pub mod key;
pub mod tree;

pub use build::TreeBuilder;
pub use key::{IndexKey, KeyOrder};
