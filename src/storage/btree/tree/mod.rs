//! The public B+ tree dictionary.
//!
//! The tree sits on a fixed pseudo-root node whose only child is the top of
//! the tree. Root splits and collapses rewrite that single link, so the root
//! handle never changes. Writers couple exclusive node locks top-down; readers
//! follow committed snapshots and, under the default node strategy, lock nothing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::cache::NodeCache;
use super::codecs::{KeyCodec, KeyComparer, ValCodec};
use super::cursor::Cursor;
use super::node::Node;
use super::options::{TreeConfig, TreeOptions};
use super::stats::{TreeStats, TreeStatsSnapshot};
use crate::primitives::concurrency::{LockCell, LockGuard, LockIntent};
use crate::primitives::journal::JournalFactory;
use crate::storage::store::{FileStore, MemoryStore, NodeStorage, StorageKind};
use crate::types::{Result, TreeError};

mod delete;
mod insert;
mod maintenance;
mod search;

pub use insert::InsertOutcome;
pub use maintenance::TreeReport;

/// Deepest descent any search accepts before reporting corruption. An order-4
/// tree this deep would hold more than 2^63 entries.
pub(crate) const MAX_DEPTH: usize = 64;

/// Occupancy limits of one node kind.
#[derive(Copy, Clone, Debug)]
pub(crate) struct NodeBounds {
    pub min: usize,
    pub max: usize,
    pub fill: usize,
}

/// A persistent ordered dictionary stored as a B+ tree.
pub struct BPlusTree<K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    pub(super) cache: NodeCache<K, V>,
    pub(super) comparer: Arc<dyn KeyComparer<K>>,
    config: TreeConfig,
    storage: Arc<dyn NodeStorage>,
    journals: Option<JournalFactory>,
    call_lock: LockCell,
    leaf_bounds: NodeBounds,
    internal_bounds: NodeBounds,
    counting: AtomicBool,
    count: AtomicU64,
    stats: Arc<TreeStats>,
}

impl<K, V> BPlusTree<K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    /// Opens the storage selected by `options`, replays any interrupted
    /// journal, and attaches to the tree, creating an empty one on new storage.
    pub fn open(options: TreeOptions<K, V>) -> Result<Self> {
        options.validate()?;
        let config = options.config().clone();
        let storage: Arc<dyn NodeStorage> = match config.storage() {
            StorageKind::Memory => Arc::new(MemoryStore::new()),
            StorageKind::Disk => {
                let path = config.file_name().ok_or(TreeError::Configuration {
                    field: "storage",
                    reason: "disk storage requires file_name",
                })?;
                Arc::new(FileStore::open(path, &config.file_store_options())?)
            }
            StorageKind::Custom => options.storage().cloned().ok_or(TreeError::Configuration {
                field: "storage",
                reason: "custom storage requires a storage instance",
            })?,
        };

        let journals = match config.journal_dir() {
            Some(dir) if !config.read_only() => {
                let factory = JournalFactory::open(dir, config.journal_streams())?;
                if let Some(persistent) = storage.as_persistent() {
                    let replayed = factory.recover(persistent)?;
                    if replayed > 0 {
                        tracing::info!(
                            target: "bpdict::journal",
                            replayed,
                            dir = %dir.display(),
                            "rolled back interrupted transactions"
                        );
                    }
                }
                Some(factory)
            }
            _ => None,
        };

        let stats = Arc::new(TreeStats::default());
        let cache = NodeCache::open(
            Arc::clone(&storage),
            config.cache_settings(),
            Arc::clone(&stats),
        )?;
        Ok(Self {
            cache,
            comparer: Arc::clone(options.comparer()),
            leaf_bounds: NodeBounds {
                min: config.min_value_nodes(),
                max: config.max_value_nodes(),
                fill: config.fill_value_nodes(),
            },
            internal_bounds: NodeBounds {
                min: config.min_child_nodes(),
                max: config.max_child_nodes(),
                fill: config.fill_child_nodes(),
            },
            config,
            storage,
            journals,
            call_lock: Arc::new(RwLock::new(())),
            counting: AtomicBool::new(false),
            count: AtomicU64::new(0),
            stats,
        })
    }

    /// The settings this tree was opened with.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Takes the tree-wide lock with the configured call-level strategy.
    pub(super) fn call_guard(&self, intent: LockIntent) -> Result<LockGuard> {
        self.config.call_level_locking().acquire(
            &self.call_lock,
            intent,
            self.config.lock_timeout(),
            "tree",
        )
    }

    pub(crate) fn bounds(&self, node: &Node<K, V>) -> NodeBounds {
        if node.is_leaf() {
            self.leaf_bounds
        } else {
            self.internal_bounds
        }
    }

    fn adjust_count(&self, added: bool) {
        if !self.counting.load(AtomicOrdering::Acquire) {
            return;
        }
        if added {
            self.count.fetch_add(1, AtomicOrdering::AcqRel);
        } else {
            // Saturates at zero.
            let _ = self
                .count
                .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |n| {
                    n.checked_sub(1)
                });
        }
    }

    /// Returns the value stored under `key`.
    pub fn try_get(&self, key: &K) -> Result<Option<V>> {
        let _call = self.call_guard(LockIntent::Read)?;
        self.find(key)
    }

    /// Returns the value stored under `key`, failing with [`TreeError::KeyNotFound`].
    pub fn get(&self, key: &K) -> Result<V> {
        self.try_get(key)?.ok_or(TreeError::KeyNotFound)
    }

    /// Returns true when `key` is present.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.try_get(key)?.is_some())
    }

    /// Inserts a new entry. Returns false, leaving the tree unchanged, when
    /// the key already exists.
    pub fn add(&self, key: K, value: V) -> Result<bool> {
        let _call = self.call_guard(LockIntent::Read)?;
        Ok(self.insert_entry(key, value, false)?.is_some())
    }

    /// Inserts a new entry, failing with [`TreeError::DuplicateKey`] when the key exists.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        if self.add(key, value)? {
            Ok(())
        } else {
            Err(TreeError::DuplicateKey)
        }
    }

    /// Inserts or overwrites the entry for `key`. An existing entry's stored
    /// key is replaced as well.
    pub fn add_or_update(&self, key: K, value: V) -> Result<InsertOutcome> {
        let _call = self.call_guard(LockIntent::Read)?;
        self.insert_entry(key, value, true)?
            .ok_or(TreeError::Corruption("update reported as duplicate"))
    }

    /// Replaces the value of an existing entry. Returns false when the key is missing.
    pub fn update(&self, key: &K, value: V) -> Result<bool> {
        let _call = self.call_guard(LockIntent::Read)?;
        self.update_entry(key, |_| Some(value))
    }

    /// Replaces the value of an existing entry with `f(old)`. Returns false when
    /// the key is missing or the new value equals the old one.
    pub fn update_with<F>(&self, key: &K, f: F) -> Result<bool>
    where
        F: FnOnce(&V) -> V,
        V: PartialEq,
    {
        let _call = self.call_guard(LockIntent::Read)?;
        self.update_entry(key, |old| {
            let new = f(old);
            (new != *old).then_some(new)
        })
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let _call = self.call_guard(LockIntent::Read)?;
        self.remove_entry(key)
    }

    /// All entries in key order.
    pub fn iter(&self) -> Cursor<'_, K, V> {
        Cursor::new(self, None)
    }

    /// Entries with keys at or after `start`, in key order.
    pub fn iter_from(&self, start: K) -> Cursor<'_, K, V> {
        Cursor::new(self, Some(start))
    }

    /// All keys in order.
    pub fn keys(&self) -> impl Iterator<Item = Result<K>> + '_ {
        self.iter().map(|item| item.map(|(key, _)| key))
    }

    /// All values in key order.
    pub fn values(&self) -> impl Iterator<Item = Result<V>> + '_ {
        self.iter().map(|item| item.map(|(_, value)| value))
    }

    /// Counts every entry and keeps the count current from now on.
    ///
    /// Call before concurrent writers start; writes racing with the initial
    /// count leave it inaccurate.
    pub fn enable_count(&self) -> Result<u64> {
        let _call = self.call_guard(LockIntent::Write)?;
        let entries = self.walk(false)?.entries;
        self.count.store(entries, AtomicOrdering::Release);
        self.counting.store(true, AtomicOrdering::Release);
        tracing::debug!(target: "bpdict::btree::search", entries, "entry count enabled");
        Ok(entries)
    }

    /// Number of entries, or `None` until [`BPlusTree::enable_count`] has run.
    pub fn count(&self) -> Option<u64> {
        self.counting
            .load(AtomicOrdering::Acquire)
            .then(|| self.count.load(AtomicOrdering::Acquire))
    }

    /// Removes every entry and frees every node.
    ///
    /// Readers that started before the tree lock was taken may still observe
    /// the old content.
    pub fn clear(&self) -> Result<()> {
        let _call = self.call_guard(LockIntent::Write)?;
        self.cache.delete_all()?;
        self.count.store(0, AtomicOrdering::Release);
        Ok(())
    }

    /// Drops every cached node.
    pub fn unload_cache(&self) -> Result<()> {
        let _call = self.call_guard(LockIntent::Write)?;
        self.cache.reset_cache();
        Ok(())
    }

    /// Checks ordering, separators, depth and fill bounds of the whole tree.
    ///
    /// Meant for quiescent trees; concurrent writers can make it report
    /// transient violations.
    pub fn validate(&self) -> Result<TreeReport> {
        let _call = self.call_guard(LockIntent::Read)?;
        self.walk(true)
    }

    /// Live statistics counters.
    pub fn stats(&self) -> Arc<TreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of the statistics counters.
    pub fn stats_snapshot(&self) -> TreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Logs the statistics counters.
    pub fn emit_stats(&self) {
        self.stats.emit_tracing();
    }

    /// Forces committed nodes to durable storage.
    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }
}

impl<K, V> std::fmt::Debug for BPlusTree<K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTree")
            .field("storage", &self.config.storage())
            .field("journal", &self.journals.as_ref().map(JournalFactory::dir))
            .field("count", &self.count())
            .finish()
    }
}
