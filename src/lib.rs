//! `bpdict`: a concurrent, persistent B+ tree dictionary.
//!
//! A [`BPlusTree`] stores ordered key/value pairs in nodes kept by a
//! [`NodeStorage`] backend, either in memory or in a fixed-block file. Every
//! structural change runs as a node transaction that can be journaled to
//! disk and rolled back after a crash.
//!
//! ```no_run
//! use bpdict::{BPlusTree, TreeOptions};
//!
//! # fn main() -> bpdict::Result<()> {
//! let tree: BPlusTree<u64, String> = BPlusTree::open(TreeOptions::default())?;
//! tree.insert(7, "seven".to_owned())?;
//! assert_eq!(tree.try_get(&7)?.as_deref(), Some("seven"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use primitives::concurrency::LockStrategy;
pub use storage::btree::{
    BPlusTree, CachePolicy, Cursor, InsertOutcome, KeyCodec, KeyComparer, TreeConfig,
    TreeOptions, TreeReport, TreeStats, TreeStatsSnapshot, ValCodec,
};
pub use storage::store::{CreatePolicy, FileStore, MemoryStore, NodeStorage, StorageKind};
pub use types::{Result, StorageHandle, TreeError};
