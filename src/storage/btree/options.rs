//! Tree configuration.
//!
//! [`TreeConfig`] holds every scalar setting and round-trips through TOML.
//! Setters validate eagerly; a deserialized config is checked by
//! [`TreeConfig::validate`] when the tree opens.

use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::cache::{CachePolicy, CacheSettings};
use super::codecs::{KeyComparer, NaturalOrder};
use crate::primitives::concurrency::{timeout_from_ms, LockStrategy};
use crate::storage::store::{CreatePolicy, FileStoreOptions, NodeStorage, StorageKind};
use crate::types::{Result, TreeError};

const STORAGE_OVERHEAD: usize = 64;
const CHILD_LINK_SIZE: usize = 32;

fn ensure(ok: bool, field: &'static str, reason: &'static str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(TreeError::Configuration { field, reason })
    }
}

fn fill_of(min: usize, max: usize) -> usize {
    ((max - min) >> 1) + min
}

fn default_writers() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(4, 16) as u32
}

/// Serializable tree settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TreeConfig {
    storage: StorageKind,
    file_name: Option<PathBuf>,
    create_policy: CreatePolicy,
    block_size: u32,
    file_growth_rate: u32,
    concurrent_writers: u32,
    read_only: bool,
    lock_timeout_ms: i64,
    node_locking: LockStrategy,
    call_level_locking: LockStrategy,
    min_child_nodes: usize,
    max_child_nodes: usize,
    fill_child_nodes: usize,
    min_value_nodes: usize,
    max_value_nodes: usize,
    fill_value_nodes: usize,
    cache_policy: CachePolicy,
    keep_alive_min_history: usize,
    keep_alive_max_history: usize,
    keep_alive_timeout_ms: u64,
    journal_dir: Option<PathBuf>,
    journal_streams: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::Memory,
            file_name: None,
            create_policy: CreatePolicy::Never,
            block_size: 4096,
            file_growth_rate: 100,
            concurrent_writers: default_writers(),
            read_only: false,
            lock_timeout_ms: 120_000,
            node_locking: LockStrategy::WriterOnly,
            call_level_locking: LockStrategy::Ignore,
            min_child_nodes: 12,
            max_child_nodes: 32,
            fill_child_nodes: 22,
            min_value_nodes: 3,
            max_value_nodes: 8,
            fill_value_nodes: 4,
            cache_policy: CachePolicy::Recent,
            keep_alive_min_history: 10,
            keep_alive_max_history: 100,
            keep_alive_timeout_ms: 60_000,
            journal_dir: None,
            journal_streams: 8,
        }
    }
}

impl TreeConfig {
    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    /// Renders this config as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// A config for a file-backed tree at `path`, creating the file when needed.
    pub fn disk(path: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageKind::Disk,
            file_name: Some(path.into()),
            create_policy: CreatePolicy::IfNeeded,
            ..Self::default()
        }
    }

    /// Checks every range and cross-field rule.
    pub fn validate(&self) -> Result<()> {
        ensure(
            (512..=65_536).contains(&self.block_size) && self.block_size.is_power_of_two(),
            "block_size",
            "must be a power of two between 512 and 65536",
        )?;
        ensure(self.file_growth_rate <= 65_535, "file_growth_rate", "must be at most 65535")?;
        ensure(
            (1..=64).contains(&self.concurrent_writers),
            "concurrent_writers",
            "must be between 1 and 64",
        )?;
        ensure(self.lock_timeout_ms >= -1, "lock_timeout_ms", "must be -1 or greater")?;
        Self::check_bounds(
            self.min_child_nodes,
            self.max_child_nodes,
            self.fill_child_nodes,
            ("min_child_nodes", "max_child_nodes", "fill_child_nodes"),
        )?;
        Self::check_bounds(
            self.min_value_nodes,
            self.max_value_nodes,
            self.fill_value_nodes,
            ("min_value_nodes", "max_value_nodes", "fill_value_nodes"),
        )?;
        ensure(
            self.keep_alive_max_history <= 65_535,
            "keep_alive_max_history",
            "must be at most 65535",
        )?;
        ensure(
            self.keep_alive_min_history <= self.keep_alive_max_history,
            "keep_alive_min_history",
            "must not exceed keep_alive_max_history",
        )?;
        ensure(
            (1..=64).contains(&self.journal_streams),
            "journal_streams",
            "must be between 1 and 64",
        )?;
        ensure(
            self.storage != StorageKind::Disk || self.file_name.is_some(),
            "storage",
            "disk storage requires file_name",
        )?;
        if self.read_only {
            ensure(
                self.storage == StorageKind::Disk,
                "read_only",
                "read_only requires disk storage",
            )?;
            ensure(
                self.create_policy == CreatePolicy::Never,
                "read_only",
                "read_only requires create_policy never",
            )?;
        }
        Ok(())
    }

    fn check_bounds(
        min: usize,
        max: usize,
        fill: usize,
        fields: (&'static str, &'static str, &'static str),
    ) -> Result<()> {
        ensure((4..=256).contains(&max), fields.1, "must be between 4 and 256")?;
        ensure(
            min >= 2 && min <= max / 2,
            fields.0,
            "must be between 2 and half the maximum",
        )?;
        ensure(
            (min..=max).contains(&fill),
            fields.2,
            "must be between the minimum and maximum",
        )
    }

    /// Selected storage backend.
    pub fn storage(&self) -> StorageKind {
        self.storage
    }

    /// Selects the storage backend. Disk requires a file name to be set first.
    pub fn set_storage(&mut self, storage: StorageKind) -> Result<()> {
        ensure(
            storage != StorageKind::Disk || self.file_name.is_some(),
            "storage",
            "disk storage requires file_name",
        )?;
        self.storage = storage;
        Ok(())
    }

    /// Backing file of disk storage.
    pub fn file_name(&self) -> Option<&Path> {
        self.file_name.as_deref()
    }

    /// Sets the backing file of disk storage.
    pub fn set_file_name(&mut self, path: impl Into<PathBuf>) {
        self.file_name = Some(path.into());
    }

    /// What to do when the backing file is missing or present.
    pub fn create_policy(&self) -> CreatePolicy {
        self.create_policy
    }

    /// Sets the create policy.
    pub fn set_create_policy(&mut self, policy: CreatePolicy) -> Result<()> {
        ensure(
            !self.read_only || policy == CreatePolicy::Never,
            "create_policy",
            "read_only requires create_policy never",
        )?;
        self.create_policy = policy;
        Ok(())
    }

    /// Block size of a new disk file.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Sets the block size, a power of two from 512 bytes to 64 KiB.
    pub fn set_block_size(&mut self, size: u32) -> Result<()> {
        ensure(
            (512..=65_536).contains(&size) && size.is_power_of_two(),
            "block_size",
            "must be a power of two between 512 and 65536",
        )?;
        self.block_size = size;
        Ok(())
    }

    /// Blocks added each time the disk file grows.
    pub fn file_growth_rate(&self) -> u32 {
        self.file_growth_rate
    }

    /// Sets the growth rate in blocks, 0 to 65535.
    pub fn set_file_growth_rate(&mut self, blocks: u32) -> Result<()> {
        ensure(blocks <= 65_535, "file_growth_rate", "must be at most 65535")?;
        self.file_growth_rate = blocks;
        Ok(())
    }

    /// Number of file handles the disk store writes through.
    pub fn concurrent_writers(&self) -> u32 {
        self.concurrent_writers
    }

    /// Sets the number of file handles, 1 to 64.
    pub fn set_concurrent_writers(&mut self, writers: u32) -> Result<()> {
        ensure(
            (1..=64).contains(&writers),
            "concurrent_writers",
            "must be between 1 and 64",
        )?;
        self.concurrent_writers = writers;
        Ok(())
    }

    /// Whether the disk file is opened without write access.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Opens the disk file read-only. Requires disk storage and create policy `Never`.
    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        if read_only {
            ensure(
                self.storage == StorageKind::Disk,
                "read_only",
                "read_only requires disk storage",
            )?;
            ensure(
                self.create_policy == CreatePolicy::Never,
                "read_only",
                "read_only requires create_policy never",
            )?;
        }
        self.read_only = read_only;
        Ok(())
    }

    /// Lock timeout in milliseconds; `-1` waits forever.
    pub fn lock_timeout_ms(&self) -> i64 {
        self.lock_timeout_ms
    }

    /// Sets the lock timeout in milliseconds; `-1` waits forever.
    pub fn set_lock_timeout_ms(&mut self, ms: i64) -> Result<()> {
        ensure(ms >= -1, "lock_timeout_ms", "must be -1 or greater")?;
        self.lock_timeout_ms = ms;
        Ok(())
    }

    /// Lock timeout as a wait limit.
    pub fn lock_timeout(&self) -> Option<Duration> {
        timeout_from_ms(self.lock_timeout_ms)
    }

    /// Locking applied to individual nodes.
    pub fn node_locking(&self) -> LockStrategy {
        self.node_locking
    }

    /// Sets the node locking strategy.
    pub fn set_node_locking(&mut self, strategy: LockStrategy) {
        self.node_locking = strategy;
    }

    /// Locking applied around every public call.
    pub fn call_level_locking(&self) -> LockStrategy {
        self.call_level_locking
    }

    /// Sets the call-level locking strategy.
    pub fn set_call_level_locking(&mut self, strategy: LockStrategy) {
        self.call_level_locking = strategy;
    }

    /// Sets both maxima to `order` and both minima to a quarter of it (at least 2).
    pub fn set_btree_order(&mut self, order: usize) -> Result<()> {
        ensure((4..=256).contains(&order), "btree_order", "must be between 4 and 256")?;
        let min = (order >> 2).max(2);
        self.set_child_bounds(min, order);
        self.set_value_bounds(min, order);
        Ok(())
    }

    /// Derives node sizes from average key and value sizes and the block size.
    pub fn calc_btree_order(&mut self, avg_key_bytes: usize, avg_value_bytes: usize) {
        let key = avg_key_bytes.min(u16::MAX as usize);
        let value = avg_value_bytes.min(u16::MAX as usize);
        let usable = (self.block_size as usize).saturating_sub(STORAGE_OVERHEAD);
        let max_child = (usable / (key + CHILD_LINK_SIZE)).clamp(4, 256);
        let max_value = (usable / (key + value).max(1)).clamp(4, 256);
        self.set_child_bounds((max_child / 3).max(2), max_child);
        self.set_value_bounds((max_value / 3).max(2), max_value);
    }

    fn set_child_bounds(&mut self, min: usize, max: usize) {
        self.max_child_nodes = max;
        self.min_child_nodes = min.min(max / 2);
        self.fill_child_nodes = fill_of(self.min_child_nodes, max);
    }

    fn set_value_bounds(&mut self, min: usize, max: usize) {
        self.max_value_nodes = max;
        self.min_value_nodes = min.min(max / 2);
        self.fill_value_nodes = fill_of(self.min_value_nodes, max);
    }

    /// Fewest links a non-top internal node keeps.
    pub fn min_child_nodes(&self) -> usize {
        self.min_child_nodes
    }

    /// Sets the internal-node minimum, 2 to half the maximum. Resets the fill target.
    pub fn set_min_child_nodes(&mut self, min: usize) -> Result<()> {
        ensure(
            min >= 2 && min <= self.max_child_nodes / 2,
            "min_child_nodes",
            "must be between 2 and half the maximum",
        )?;
        self.min_child_nodes = min;
        self.fill_child_nodes = fill_of(min, self.max_child_nodes);
        Ok(())
    }

    /// Most links an internal node holds before it splits.
    pub fn max_child_nodes(&self) -> usize {
        self.max_child_nodes
    }

    /// Sets the internal-node maximum, 4 to 256. The minimum becomes half of it.
    pub fn set_max_child_nodes(&mut self, max: usize) -> Result<()> {
        ensure((4..=256).contains(&max), "max_child_nodes", "must be between 4 and 256")?;
        self.set_child_bounds(max / 2, max);
        Ok(())
    }

    /// Size an internal node merge may produce without a redistribution.
    pub fn fill_child_nodes(&self) -> usize {
        self.fill_child_nodes
    }

    /// Sets the internal-node fill target, between minimum and maximum.
    pub fn set_fill_child_nodes(&mut self, fill: usize) -> Result<()> {
        ensure(
            (self.min_child_nodes..=self.max_child_nodes).contains(&fill),
            "fill_child_nodes",
            "must be between the minimum and maximum",
        )?;
        self.fill_child_nodes = fill;
        Ok(())
    }

    /// Fewest entries a non-top leaf keeps.
    pub fn min_value_nodes(&self) -> usize {
        self.min_value_nodes
    }

    /// Sets the leaf minimum, 2 to half the maximum. Resets the fill target.
    pub fn set_min_value_nodes(&mut self, min: usize) -> Result<()> {
        ensure(
            min >= 2 && min <= self.max_value_nodes / 2,
            "min_value_nodes",
            "must be between 2 and half the maximum",
        )?;
        self.min_value_nodes = min;
        self.fill_value_nodes = fill_of(min, self.max_value_nodes);
        Ok(())
    }

    /// Most entries a leaf holds before it splits.
    pub fn max_value_nodes(&self) -> usize {
        self.max_value_nodes
    }

    /// Sets the leaf maximum, 4 to 256. The minimum becomes half of it.
    pub fn set_max_value_nodes(&mut self, max: usize) -> Result<()> {
        ensure((4..=256).contains(&max), "max_value_nodes", "must be between 4 and 256")?;
        self.set_value_bounds(max / 2, max);
        Ok(())
    }

    /// Size a leaf merge may produce without a redistribution.
    pub fn fill_value_nodes(&self) -> usize {
        self.fill_value_nodes
    }

    /// Sets the leaf fill target, between minimum and maximum.
    pub fn set_fill_value_nodes(&mut self, fill: usize) -> Result<()> {
        ensure(
            (self.min_value_nodes..=self.max_value_nodes).contains(&fill),
            "fill_value_nodes",
            "must be between the minimum and maximum",
        )?;
        self.fill_value_nodes = fill;
        Ok(())
    }

    /// Node residency policy.
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Sets the node residency policy.
    pub fn set_cache_policy(&mut self, policy: CachePolicy) {
        self.cache_policy = policy;
    }

    /// Nodes kept by the recent policy regardless of age.
    pub fn keep_alive_min_history(&self) -> usize {
        self.keep_alive_min_history
    }

    /// Sets the minimum history, raising the maximum when needed.
    pub fn set_keep_alive_min_history(&mut self, count: usize) -> Result<()> {
        ensure(count <= 65_535, "keep_alive_min_history", "must be at most 65535")?;
        self.keep_alive_min_history = count;
        self.keep_alive_max_history = self.keep_alive_max_history.max(count);
        Ok(())
    }

    /// Most nodes kept by the recent policy.
    pub fn keep_alive_max_history(&self) -> usize {
        self.keep_alive_max_history
    }

    /// Sets the maximum history, lowering the minimum when needed.
    pub fn set_keep_alive_max_history(&mut self, count: usize) -> Result<()> {
        ensure(count <= 65_535, "keep_alive_max_history", "must be at most 65535")?;
        self.keep_alive_max_history = count;
        self.keep_alive_min_history = self.keep_alive_min_history.min(count);
        Ok(())
    }

    /// Age after which nodes beyond the minimum history are evicted.
    pub fn keep_alive_timeout_ms(&self) -> u64 {
        self.keep_alive_timeout_ms
    }

    /// Sets the keep-alive timeout in milliseconds.
    pub fn set_keep_alive_timeout_ms(&mut self, ms: u64) {
        self.keep_alive_timeout_ms = ms;
    }

    /// Directory of the durable journal, when enabled.
    pub fn journal_dir(&self) -> Option<&Path> {
        self.journal_dir.as_deref()
    }

    /// Enables the durable journal in `dir`; `None` disables it.
    pub fn set_journal_dir(&mut self, dir: Option<PathBuf>) {
        self.journal_dir = dir;
    }

    /// Journal files kept for concurrent transactions.
    pub fn journal_streams(&self) -> usize {
        self.journal_streams
    }

    /// Sets the journal pool size, 1 to 64.
    pub fn set_journal_streams(&mut self, streams: usize) -> Result<()> {
        ensure(
            (1..=64).contains(&streams),
            "journal_streams",
            "must be between 1 and 64",
        )?;
        self.journal_streams = streams;
        Ok(())
    }

    pub(crate) fn file_store_options(&self) -> FileStoreOptions {
        FileStoreOptions {
            block_size: self.block_size,
            growth_rate: self.file_growth_rate,
            concurrent_writers: self.concurrent_writers,
            create_policy: self.create_policy,
            read_only: self.read_only,
        }
    }

    pub(crate) fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            policy: self.cache_policy,
            node_locking: self.node_locking,
            lock_timeout: self.lock_timeout(),
            min_history: self.keep_alive_min_history,
            max_history: self.keep_alive_max_history,
            keep_alive: Duration::from_millis(self.keep_alive_timeout_ms),
        }
    }
}

/// Everything a tree needs to open: the serializable config plus the key
/// order and an optional caller-supplied store.
pub struct TreeOptions<K, V> {
    config: TreeConfig,
    comparer: Arc<dyn KeyComparer<K>>,
    storage: Option<Arc<dyn NodeStorage>>,
    _marker: PhantomData<fn() -> V>,
}

impl<K, V> Clone for TreeOptions<K, V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            comparer: Arc::clone(&self.comparer),
            storage: self.storage.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, V> fmt::Debug for TreeOptions<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeOptions")
            .field("config", &self.config)
            .field("custom_storage", &self.storage.is_some())
            .finish()
    }
}

impl<K: Ord + 'static, V> Default for TreeOptions<K, V> {
    fn default() -> Self {
        Self::new(TreeConfig::default())
    }
}

impl<K: Ord + 'static, V> TreeOptions<K, V> {
    /// Options ordering keys by [`Ord`].
    pub fn new(config: TreeConfig) -> Self {
        Self::with_comparer(config, NaturalOrder)
    }
}

impl<K, V> TreeOptions<K, V> {
    /// Options ordering keys with `comparer`.
    pub fn with_comparer(config: TreeConfig, comparer: impl KeyComparer<K> + 'static) -> Self {
        Self {
            config,
            comparer: Arc::new(comparer),
            storage: None,
            _marker: PhantomData,
        }
    }

    /// The scalar settings.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Mutable access to the scalar settings.
    pub fn config_mut(&mut self) -> &mut TreeConfig {
        &mut self.config
    }

    /// The key order.
    pub fn comparer(&self) -> &Arc<dyn KeyComparer<K>> {
        &self.comparer
    }

    /// Uses `storage` and switches the config to custom storage.
    pub fn set_storage(&mut self, storage: Arc<dyn NodeStorage>) {
        self.storage = Some(storage);
        self.config.storage = StorageKind::Custom;
    }

    /// The caller-supplied store, if any.
    pub fn storage(&self) -> Option<&Arc<dyn NodeStorage>> {
        self.storage.as_ref()
    }

    /// Checks the config and that custom storage has a store.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        ensure(
            self.config.storage != StorageKind::Custom || self.storage.is_some(),
            "storage",
            "custom storage requires a storage instance",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() -> Result<()> {
        let config = TreeConfig::default();
        config.validate()?;
        assert_eq!(config.lock_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(
            (config.min_child_nodes(), config.max_child_nodes(), config.fill_child_nodes()),
            (12, 32, 22)
        );
        assert_eq!(
            (config.min_value_nodes(), config.max_value_nodes(), config.fill_value_nodes()),
            (3, 8, 4)
        );
        assert_eq!(config.cache_policy(), CachePolicy::Recent);
        assert_eq!(config.node_locking(), LockStrategy::WriterOnly);
        assert_eq!(config.call_level_locking(), LockStrategy::Ignore);
        assert!((4..=16).contains(&config.concurrent_writers()));
        Ok(())
    }

    #[test]
    fn setters_reject_out_of_range_values() {
        let mut config = TreeConfig::default();
        assert!(matches!(
            config.set_block_size(256),
            Err(TreeError::Configuration { field: "block_size", .. })
        ));
        assert!(config.set_block_size(3000).is_err());
        assert!(config.set_concurrent_writers(0).is_err());
        assert!(config.set_concurrent_writers(65).is_err());
        assert!(config.set_lock_timeout_ms(-2).is_err());
        assert!(config.set_btree_order(3).is_err());
        assert!(config.set_min_value_nodes(5).is_err());
        assert!(config.set_fill_value_nodes(9).is_err());
        assert!(config.set_read_only(true).is_err());
        assert!(config.set_storage(StorageKind::Disk).is_err());
        assert_eq!(config, TreeConfig::default());
    }

    #[test]
    fn order_helpers_keep_bounds_consistent() -> Result<()> {
        let mut config = TreeConfig::default();
        config.set_btree_order(16)?;
        assert_eq!((config.min_value_nodes(), config.max_value_nodes()), (4, 16));
        assert_eq!(config.fill_child_nodes(), 10);
        config.set_btree_order(4)?;
        assert_eq!((config.min_child_nodes(), config.max_child_nodes()), (2, 4));
        config.calc_btree_order(100, 500);
        assert_eq!(config.max_child_nodes(), 30);
        assert_eq!(config.max_value_nodes(), 6);
        assert_eq!(config.min_value_nodes(), 2);
        config.validate()?;
        config.set_max_child_nodes(40)?;
        assert_eq!(config.min_child_nodes(), 20);
        Ok(())
    }

    #[test]
    fn history_setters_keep_min_below_max() -> Result<()> {
        let mut config = TreeConfig::default();
        config.set_keep_alive_max_history(5)?;
        assert_eq!(config.keep_alive_min_history(), 5);
        config.set_keep_alive_min_history(50)?;
        assert_eq!(config.keep_alive_max_history(), 50);
        Ok(())
    }

    #[test]
    fn toml_round_trip_and_validation() -> Result<()> {
        let mut config = TreeConfig::disk("/tmp/tree.bpd");
        config.set_btree_order(64)?;
        config.set_cache_policy(CachePolicy::All);
        let text = config.to_toml_string()?;
        assert_eq!(TreeConfig::from_toml_str(&text)?, config);

        let partial = TreeConfig::from_toml_str("cache_policy = \"none\"\nlock_timeout_ms = -1\n")?;
        assert_eq!(partial.cache_policy(), CachePolicy::None);
        assert_eq!(partial.lock_timeout(), None);

        assert!(matches!(
            TreeConfig::from_toml_str("block_size = 100"),
            Err(TreeError::Configuration { .. })
        ));
        assert!(matches!(
            TreeConfig::from_toml_str("storage = \"disk\""),
            Err(TreeError::Configuration { field: "storage", .. })
        ));
        assert!(matches!(
            TreeConfig::from_toml_str("no_such_key = 1"),
            Err(TreeError::ConfigParse(_))
        ));
        Ok(())
    }

    #[test]
    fn custom_storage_requires_an_instance() {
        let mut options: TreeOptions<u64, u64> = TreeOptions::default();
        assert!(options.validate().is_ok());
        options.config.storage = StorageKind::Custom;
        assert!(options.validate().is_err());
        options.set_storage(Arc::new(crate::storage::store::MemoryStore::new()));
        assert!(options.validate().is_ok());
    }
}
