//! Node storage backends and the B+ tree built on them.

/// The B+ tree dictionary, its node cache and node transactions.
pub mod btree;

/// Handle-based node storage: the contract plus memory and file backends.
pub mod store;
