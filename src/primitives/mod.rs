//! Low-level building blocks shared by the storage layer.
//!
//! Positioned file I/O, lock strategies and the durable transaction journal.

/// Lock strategies, timed acquisition and directory claims.
pub mod concurrency;

/// Positioned file I/O.
pub mod io;

/// Durable transaction journal and its file pool.
pub mod journal;
