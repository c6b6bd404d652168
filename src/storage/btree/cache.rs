//! Node cache: maps storage handles to locked, live nodes.
//!
//! Every handle gets one [`NodeSlot`] holding its lock, the last published
//! node and a publication stamp. Committed nodes are shared as `Arc`s and
//! never mutated, so readers keep a consistent snapshot of whatever they pinned.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::codecs::{KeyCodec, ValCodec};
use super::node::Node;
use super::pin::NodePin;
use super::stats::TreeStats;
use super::version::{NodeVersion, VersionHistory};
use crate::primitives::concurrency::{LockCell, LockIntent, LockStrategy};
use crate::storage::store::NodeStorage;
use crate::types::{Result, StorageHandle, TreeError};

/// Residency policy for loaded nodes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Keep every loaded node until the cache is reset.
    All,
    /// Keep nodes only while something pins them.
    None,
    /// Keep a bounded, time-limited history of recently used nodes.
    #[default]
    Recent,
}

#[derive(Clone, Debug)]
pub(crate) struct CacheSettings {
    pub policy: CachePolicy,
    pub node_locking: LockStrategy,
    pub lock_timeout: Option<Duration>,
    pub min_history: usize,
    pub max_history: usize,
    pub keep_alive: Duration,
}

struct SlotState<K, V> {
    node: Option<Arc<Node<K, V>>>,
    stamp: u64,
    /// A transaction destroys the node; writers must not reach it.
    destroyed: bool,
    /// A commit is writing the handle; the cached node must stay resident.
    writing: bool,
}

/// Per-handle lock, cached node and publication stamp.
pub(crate) struct NodeSlot<K, V> {
    lock: LockCell,
    state: Mutex<SlotState<K, V>>,
}

impl<K, V> NodeSlot<K, V> {
    fn new() -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            state: Mutex::new(SlotState {
                node: None,
                stamp: 0,
                destroyed: false,
                writing: false,
            }),
        }
    }

    pub fn lock_cell(&self) -> &LockCell {
        &self.lock
    }

    /// Bumped whenever the handle's committed content changes.
    pub fn stamp(&self) -> u64 {
        self.state.lock().stamp
    }

    pub fn publish(&self, node: Arc<Node<K, V>>) -> u64 {
        let mut state = self.state.lock();
        state.node = Some(node);
        state.writing = false;
        state.destroyed = false;
        state.stamp += 1;
        state.stamp
    }

    /// Flags the node as destroyed by an open transaction, or clears the flag
    /// when that transaction rolls back. The cached node stays for readers.
    pub fn set_destroyed(&self, destroyed: bool) {
        self.state.lock().destroyed = destroyed;
    }

    fn mark_destroyed(&self) {
        let mut state = self.state.lock();
        state.node = None;
        state.writing = false;
        state.destroyed = true;
        state.stamp += 1;
    }

    /// Forgets whatever the slot held, committed or not.
    fn discard(&self) {
        let mut state = self.state.lock();
        state.node = None;
        state.writing = false;
        state.destroyed = false;
        state.stamp += 1;
    }

    fn evict(&self) -> bool {
        let mut state = self.state.lock();
        if state.writing {
            return false;
        }
        state.node.take().is_some()
    }
}

enum SlotTable<K, V> {
    Strong(HashMap<StorageHandle, Arc<NodeSlot<K, V>>>),
    Weak {
        slots: HashMap<StorageHandle, Weak<NodeSlot<K, V>>>,
        sweep_at: usize,
    },
}

const WEAK_SWEEP_MIN: usize = 64;

pub(crate) struct NodeCache<K, V> {
    storage: Arc<dyn NodeStorage>,
    settings: CacheSettings,
    root: StorageHandle,
    slots: Mutex<SlotTable<K, V>>,
    recent: Mutex<LruCache<StorageHandle, Instant>>,
    versions: VersionHistory<K, V>,
    stats: Arc<TreeStats>,
}

impl<K, V> NodeCache<K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    /// Attaches to `storage`, writing an empty tree when the root slot is new.
    pub fn open(
        storage: Arc<dyn NodeStorage>,
        settings: CacheSettings,
        stats: Arc<TreeStats>,
    ) -> Result<Self> {
        let slots = match settings.policy {
            CachePolicy::None => SlotTable::Weak {
                slots: HashMap::new(),
                sweep_at: WEAK_SWEEP_MIN,
            },
            CachePolicy::All | CachePolicy::Recent => SlotTable::Strong(HashMap::new()),
        };
        let (root, _) = storage.open_root()?;
        let versions = VersionHistory::new(Arc::clone(&storage));
        let cache = Self {
            storage,
            settings,
            root,
            slots: Mutex::new(slots),
            recent: Mutex::new(LruCache::unbounded()),
            versions,
            stats,
        };
        cache.initialize()?;
        Ok(cache)
    }

    fn initialize(&self) -> Result<()> {
        let (root, is_new) = self.storage.open_root()?;
        if !is_new {
            let bytes = self
                .storage
                .try_get_node(root)?
                .ok_or(TreeError::Corruption("root node missing"))?;
            let node = Node::<K, V>::decode(&bytes)?;
            if !node.is_root || node.len() != 1 {
                return Err(TreeError::Corruption("root node malformed"));
            }
            return Ok(());
        }
        let top = self.storage.create()?;
        self.storage
            .write_node(top, &Node::<K, V>::new_leaf().encode())?;
        self.storage
            .write_node(root, &Node::<K, V>::new_root(top).encode())?;
        self.storage.flush()?;
        tracing::debug!(
            target: "bpdict::cache",
            root = %root,
            top = %top,
            "initialized empty tree"
        );
        Ok(())
    }

    pub fn storage(&self) -> &dyn NodeStorage {
        self.storage.as_ref()
    }

    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    pub fn versions(&self) -> &VersionHistory<K, V> {
        &self.versions
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.settings.lock_timeout
    }

    fn slot(&self, handle: StorageHandle) -> Arc<NodeSlot<K, V>> {
        let mut table = self.slots.lock();
        match &mut *table {
            SlotTable::Strong(slots) => Arc::clone(
                slots
                    .entry(handle)
                    .or_insert_with(|| Arc::new(NodeSlot::new())),
            ),
            SlotTable::Weak { slots, sweep_at } => {
                if let Some(slot) = slots.get(&handle).and_then(Weak::upgrade) {
                    return slot;
                }
                let slot = Arc::new(NodeSlot::new());
                slots.insert(handle, Arc::downgrade(&slot));
                if slots.len() >= *sweep_at {
                    slots.retain(|_, weak| weak.strong_count() > 0);
                    *sweep_at = (slots.len() * 2).max(WEAK_SWEEP_MIN);
                }
                slot
            }
        }
    }

    fn existing_slot(&self, handle: StorageHandle) -> Option<Arc<NodeSlot<K, V>>> {
        let table = self.slots.lock();
        match &*table {
            SlotTable::Strong(slots) => slots.get(&handle).cloned(),
            SlotTable::Weak { slots, .. } => slots.get(&handle).and_then(Weak::upgrade),
        }
    }

    fn all_slots(&self) -> Vec<Arc<NodeSlot<K, V>>> {
        let table = self.slots.lock();
        match &*table {
            SlotTable::Strong(slots) => slots.values().cloned().collect(),
            SlotTable::Weak { slots, .. } => slots.values().filter_map(Weak::upgrade).collect(),
        }
    }

    fn touch(&self, handle: StorageHandle) {
        if self.settings.policy != CachePolicy::Recent {
            return;
        }
        let mut evicted = Vec::new();
        {
            let mut recent = self.recent.lock();
            recent.put(handle, Instant::now());
            while recent.len() > self.settings.max_history {
                match recent.pop_lru() {
                    Some((old, _)) => evicted.push(old),
                    None => break,
                }
            }
            while recent.len() > self.settings.min_history {
                match recent.peek_lru() {
                    Some((_, used)) if used.elapsed() >= self.settings.keep_alive => {
                        if let Some((old, _)) = recent.pop_lru() {
                            evicted.push(old);
                        }
                    }
                    _ => break,
                }
            }
        }
        let mut count = 0;
        for old in evicted {
            if let Some(slot) = self.existing_slot(old) {
                if slot.evict() {
                    count += 1;
                }
            }
        }
        if count > 0 {
            self.stats.add_cache_evictions(count);
            tracing::trace!(target: "bpdict::cache", evicted = count, "pruned node history");
        }
    }

    /// Returns the node published for `handle`, reading storage on a miss.
    /// The stamp is `None` when the node came from a retired snapshot.
    fn load(
        &self,
        handle: StorageHandle,
        slot: &NodeSlot<K, V>,
        reader: bool,
    ) -> Result<(Arc<Node<K, V>>, Option<u64>)> {
        let loaded = {
            let mut state = slot.state.lock();
            if state.destroyed {
                let cached = state.node.clone();
                drop(state);
                return self.load_destroyed(handle, cached, reader);
            }
            match &state.node {
                Some(node) => {
                    self.stats.inc_cache_hits();
                    (Arc::clone(node), Some(state.stamp))
                }
                None => {
                    let bytes = self
                        .storage
                        .try_get_node(handle)?
                        .ok_or(TreeError::Corruption("node handle not found"))?;
                    let node = Arc::new(Node::decode(&bytes)?);
                    self.stats.inc_cache_misses();
                    state.node = Some(Arc::clone(&node));
                    (node, Some(state.stamp))
                }
            }
        };
        self.touch(handle);
        Ok(loaded)
    }

    /// Writers fail on a destroyed node. A reader that reached one before its
    /// retirement gets the last committed node; the bytes stay allocated until
    /// then and are read without caching them.
    fn load_destroyed(
        &self,
        handle: StorageHandle,
        cached: Option<Arc<Node<K, V>>>,
        reader: bool,
    ) -> Result<(Arc<Node<K, V>>, Option<u64>)> {
        if !reader {
            return Err(TreeError::Protocol("node was destroyed"));
        }
        if let Some(node) = cached.or_else(|| self.versions.latest(handle)) {
            return Ok((node, None));
        }
        let bytes = self
            .storage
            .try_get_node(handle)?
            .ok_or(TreeError::Corruption("node handle not found"))?;
        Ok((Arc::new(Node::decode(&bytes)?), None))
    }

    /// Pins `handle` with the lock the node strategy assigns to `intent`.
    ///
    /// Readers pass their version so nodes destroyed after they started stay visible.
    pub fn lock(
        &self,
        handle: StorageHandle,
        intent: LockIntent,
        version: Option<&NodeVersion<'_, K, V>>,
    ) -> Result<NodePin<K, V>> {
        let slot = self.slot(handle);
        let guard = self.settings.node_locking.acquire(
            slot.lock_cell(),
            intent,
            self.settings.lock_timeout,
            "node",
        )?;
        let reader = intent == LockIntent::Read;
        if let Some(version) = version.filter(|_| reader) {
            if let Some(node) = self.versions.lookup(handle, version.id()) {
                tracing::trace!(
                    target: "bpdict::cache",
                    handle = %handle,
                    "using retired snapshot"
                );
                return Ok(NodePin::committed(handle, slot, intent, guard, node, None));
            }
        }
        let (node, stamp) = self.load(handle, &slot, reader)?;
        Ok(NodePin::committed(handle, slot, intent, guard, node, stamp))
    }

    pub fn lock_root(
        &self,
        intent: LockIntent,
        version: Option<&NodeVersion<'_, K, V>>,
    ) -> Result<NodePin<K, V>> {
        self.lock(self.root, intent, version)
    }

    /// Allocates a handle and pins it for a node that exists only in a transaction.
    pub fn create_pin(&self, node: Node<K, V>) -> Result<NodePin<K, V>> {
        let handle = self.storage.create()?;
        let slot = self.slot(handle);
        let guard = match self.settings.node_locking.acquire(
            slot.lock_cell(),
            LockIntent::Write,
            self.settings.lock_timeout,
            "node",
        ) {
            Ok(guard) => guard,
            Err(err) => {
                if let Err(free_err) = self.storage.destroy(handle) {
                    tracing::warn!(
                        target: "bpdict::cache",
                        handle = %handle,
                        error = %free_err,
                        "failed to free handle"
                    );
                }
                return Err(err);
            }
        };
        slot.discard();
        Ok(NodePin::created(handle, slot, guard, node))
    }

    /// Writes `node` to storage while holding the slot, so lock-free readers
    /// never load a partially written node.
    ///
    /// The committed node stays cached until the write is published or
    /// discarded, so readers never load uncommitted bytes.
    pub fn write(&self, pin: &NodePin<K, V>, node: &Node<K, V>) -> Result<()> {
        let mut state = pin.slot().state.lock();
        if !state.writing {
            state.writing = true;
            if state.node.is_none() {
                state.node = pin.original().cloned();
            }
        }
        self.storage.write_node(pin.handle(), &node.encode())
    }

    /// Marks the slot of a committed destruction so writers fail fast on it.
    pub fn mark_destroyed(&self, handle: StorageHandle, slot: &NodeSlot<K, V>) {
        slot.mark_destroyed();
        if self.settings.policy == CachePolicy::Recent {
            self.recent.lock().pop(&handle);
        }
    }

    /// Drops whatever a failed or abandoned write left in the slot.
    pub fn discard(&self, handle: StorageHandle, slot: &NodeSlot<K, V>) {
        slot.discard();
        if self.settings.policy == CachePolicy::Recent {
            self.recent.lock().pop(&handle);
        }
    }

    /// Drops every cached node. Locks and stamps are kept.
    pub fn reset_cache(&self) {
        let mut evicted = 0;
        for slot in self.all_slots() {
            if slot.evict() {
                evicted += 1;
            }
        }
        self.recent.lock().clear();
        self.stats.add_cache_evictions(evicted);
        tracing::debug!(target: "bpdict::cache", evicted, "cache reset");
    }

    /// Frees every node in storage and writes a new empty tree.
    pub fn delete_all(&self) -> Result<()> {
        self.versions.reset_with(|| self.storage.reset())?;
        for slot in self.all_slots() {
            slot.discard();
        }
        self.recent.lock().clear();
        self.initialize()?;
        tracing::debug!(target: "bpdict::cache", "all nodes deleted");
        Ok(())
    }

    /// Number of nodes currently held in memory.
    pub fn resident(&self) -> usize {
        self.all_slots()
            .iter()
            .filter(|slot| slot.state.lock().node.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MemoryStore;

    fn settings(policy: CachePolicy, max_history: usize) -> CacheSettings {
        CacheSettings {
            policy,
            node_locking: LockStrategy::WriterOnly,
            lock_timeout: Some(Duration::from_millis(50)),
            min_history: 0,
            max_history,
            keep_alive: Duration::from_secs(60),
        }
    }

    fn open(policy: CachePolicy, max_history: usize) -> Result<NodeCache<u64, u64>> {
        NodeCache::open(
            Arc::new(MemoryStore::new()),
            settings(policy, max_history),
            Arc::new(TreeStats::default()),
        )
    }

    #[test]
    fn opening_writes_an_empty_tree() -> Result<()> {
        let cache = open(CachePolicy::All, 0)?;
        let root = cache.lock_root(LockIntent::Read, None)?;
        assert!(root.node().is_root);
        let top = cache.lock(root.node().child(0)?, LockIntent::Read, None)?;
        assert!(top.node().is_leaf());
        assert_eq!(top.node().len(), 0);
        assert_eq!(cache.stats().snapshot().cache_misses, 2);
        cache.lock_root(LockIntent::Read, None)?;
        assert_eq!(cache.stats().snapshot().cache_hits, 1);
        Ok(())
    }

    #[test]
    fn writers_exclude_each_other() -> Result<()> {
        let cache = open(CachePolicy::All, 0)?;
        let held = cache.lock_root(LockIntent::Write, None)?;
        assert!(matches!(
            cache.lock_root(LockIntent::Write, None),
            Err(TreeError::LockTimeout("node"))
        ));
        assert!(cache.lock_root(LockIntent::Read, None).is_ok());
        drop(held);
        cache.lock_root(LockIntent::Write, None)?;
        Ok(())
    }

    #[test]
    fn recent_policy_bounds_residency() -> Result<()> {
        let cache = open(CachePolicy::Recent, 1)?;
        let root = cache.lock_root(LockIntent::Read, None)?;
        let top = root.node().child(0)?;
        drop(root);
        cache.lock(top, LockIntent::Read, None)?;
        assert_eq!(cache.resident(), 1);
        assert!(cache.stats().snapshot().cache_evictions >= 1);
        Ok(())
    }

    #[test]
    fn none_policy_forgets_unpinned_nodes() -> Result<()> {
        let cache = open(CachePolicy::None, 0)?;
        let pin = cache.lock_root(LockIntent::Read, None)?;
        assert_eq!(cache.resident(), 1);
        drop(pin);
        assert_eq!(cache.resident(), 0);
        cache.lock_root(LockIntent::Read, None)?;
        assert_eq!(cache.stats().snapshot().cache_misses, 2);
        Ok(())
    }

    #[test]
    fn reset_and_delete_all() -> Result<()> {
        let cache = open(CachePolicy::All, 0)?;
        let root = cache.lock_root(LockIntent::Read, None)?;
        let stamp = root.stamp();
        drop(root);
        cache.reset_cache();
        assert_eq!(cache.resident(), 0);
        cache.delete_all()?;
        let root = cache.lock_root(LockIntent::Read, None)?;
        assert_ne!(root.stamp(), stamp);
        assert_eq!(root.node().len(), 1);
        Ok(())
    }
}
