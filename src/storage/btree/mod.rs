#![forbid(unsafe_code)]

//! Concurrent copy-on-write B+ tree over handle-based node storage.
//!
//! Layers, bottom-up: `node` is the in-memory node and its byte layout,
//! `cache` hands out locked pins, `transaction` groups node creations,
//! deletions and one update into an atomic unit, and `tree` runs search,
//! insert and delete through them.

/// Key and value encodings and the key order.
pub mod codecs;

mod cache;
mod cursor;
mod node;
mod options;
mod pin;
mod stats;
mod transaction;
mod tree;
mod version;

pub use cache::CachePolicy;
pub use codecs::{FnComparer, KeyCodec, KeyComparer, NaturalOrder, ValCodec};
pub use cursor::Cursor;
pub use options::{TreeConfig, TreeOptions};
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use tree::{BPlusTree, InsertOutcome, TreeReport};
