use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeStatsSnapshot {
    /// Point lookups and cursor seeks
    pub searches: u64,
    /// Entries added to a leaf
    pub inserts: u64,
    /// Leaf values replaced in place
    pub updates: u64,
    /// Entries removed from a leaf
    pub removes: u64,
    /// Leaf nodes split in two
    pub leaf_splits: u64,
    /// Internal nodes split in two
    pub internal_splits: u64,
    /// Splits of the top node that grew the tree by one level
    pub root_splits: u64,
    /// Sibling pairs merged into one node
    pub merges: u64,
    /// Sibling pairs whose entries were redistributed
    pub redistributions: u64,
    /// Merges that removed a level from the top of the tree
    pub root_collapses: u64,
    /// Node loads served from the cache
    pub cache_hits: u64,
    /// Node loads that read storage
    pub cache_misses: u64,
    /// Nodes dropped from the cache by the eviction policy
    pub cache_evictions: u64,
    /// Node transactions committed
    pub commits: u64,
    /// Node transactions rolled back
    pub rollbacks: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default)]
pub struct TreeStats {
    searches: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    removes: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    root_splits: AtomicU64,
    merges: AtomicU64,
    redistributions: AtomicU64,
    root_collapses: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, AtomicOrdering::Relaxed);
}

impl TreeStats {
    pub(crate) fn inc_searches(&self) {
        bump(&self.searches);
    }

    pub(crate) fn inc_inserts(&self) {
        bump(&self.inserts);
    }

    pub(crate) fn inc_updates(&self) {
        bump(&self.updates);
    }

    pub(crate) fn inc_removes(&self) {
        bump(&self.removes);
    }

    pub(crate) fn inc_splits(&self, leaf: bool) {
        if leaf {
            bump(&self.leaf_splits);
        } else {
            bump(&self.internal_splits);
        }
    }

    pub(crate) fn inc_root_splits(&self) {
        bump(&self.root_splits);
    }

    pub(crate) fn inc_merges(&self) {
        bump(&self.merges);
    }

    pub(crate) fn inc_redistributions(&self) {
        bump(&self.redistributions);
    }

    pub(crate) fn inc_root_collapses(&self) {
        bump(&self.root_collapses);
    }

    pub(crate) fn inc_cache_hits(&self) {
        bump(&self.cache_hits);
    }

    pub(crate) fn inc_cache_misses(&self) {
        bump(&self.cache_misses);
    }

    pub(crate) fn add_cache_evictions(&self, count: u64) {
        self.cache_evictions
            .fetch_add(count, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_commits(&self) {
        bump(&self.commits);
    }

    pub(crate) fn inc_rollbacks(&self) {
        bump(&self.rollbacks);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(AtomicOrdering::Relaxed);
        TreeStatsSnapshot {
            searches: load(&self.searches),
            inserts: load(&self.inserts),
            updates: load(&self.updates),
            removes: load(&self.removes),
            leaf_splits: load(&self.leaf_splits),
            internal_splits: load(&self.internal_splits),
            root_splits: load(&self.root_splits),
            merges: load(&self.merges),
            redistributions: load(&self.redistributions),
            root_collapses: load(&self.root_collapses),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            cache_evictions: load(&self.cache_evictions),
            commits: load(&self.commits),
            rollbacks: load(&self.rollbacks),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "bpdict::stats",
            searches = snapshot.searches,
            inserts = snapshot.inserts,
            updates = snapshot.updates,
            removes = snapshot.removes,
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            root_splits = snapshot.root_splits,
            merges = snapshot.merges,
            redistributions = snapshot.redistributions,
            root_collapses = snapshot.root_collapses,
            cache_hits = snapshot.cache_hits,
            cache_misses = snapshot.cache_misses,
            cache_evictions = snapshot.cache_evictions,
            commits = snapshot.commits,
            rollbacks = snapshot.rollbacks,
            "tree stats snapshot"
        );
    }
}
