use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::node::Node;
use crate::storage::store::NodeStorage;
use crate::types::{Result, StorageHandle};

struct Retired<K, V> {
    version: u64,
    handle: StorageHandle,
    node: Arc<Node<K, V>>,
}

struct VersionState<K, V> {
    current: u64,
    readers: BTreeMap<u64, usize>,
    retired: Vec<Retired<K, V>>,
    /// Bumped when storage is reset, voiding frees computed before it.
    epoch: u64,
}

/// Keeps destroyed node snapshots alive while a reader that started before
/// their destruction may still reach them through a stale parent.
///
/// The history also owns the storage handles of those nodes. A handle goes
/// back to storage only once no reader older than its retirement remains, so
/// a handle a reader may still follow is never reused for another node.
pub(crate) struct VersionHistory<K, V> {
    storage: Arc<dyn NodeStorage>,
    state: Mutex<VersionState<K, V>>,
    freeing: Mutex<()>,
}

impl<K, V> VersionHistory<K, V> {
    pub fn new(storage: Arc<dyn NodeStorage>) -> Self {
        Self {
            storage,
            state: Mutex::new(VersionState {
                current: 0,
                readers: BTreeMap::new(),
                retired: Vec::new(),
                epoch: 0,
            }),
            freeing: Mutex::new(()),
        }
    }

    /// Registers a reader at the current version.
    pub fn acquire(&self) -> NodeVersion<'_, K, V> {
        let mut state = self.state.lock();
        let version = state.current;
        *state.readers.entry(version).or_insert(0) += 1;
        NodeVersion {
            history: self,
            version,
        }
    }

    fn release(&self, version: u64) {
        let (epoch, freed) = {
            let mut state = self.state.lock();
            if let Some(count) = state.readers.get_mut(&version) {
                *count -= 1;
                if *count == 0 {
                    state.readers.remove(&version);
                }
            }
            (state.epoch, Self::purge(&mut state))
        };
        if let Err(err) = self.free(epoch, freed) {
            tracing::warn!(target: "bpdict::cache", error = %err, "failed to free retired handles");
        }
    }

    /// Drops every retirement no registered reader can need and returns the
    /// handles that became free.
    fn purge(state: &mut VersionState<K, V>) -> Vec<StorageHandle> {
        let oldest = state.readers.keys().next().copied();
        let mut freed = Vec::new();
        state.retired.retain(|entry| {
            let needed = oldest.is_some_and(|oldest| oldest < entry.version);
            if !needed {
                freed.push(entry.handle);
            }
            needed
        });
        freed
    }

    fn free(&self, epoch: u64, handles: Vec<StorageHandle>) -> Result<()> {
        if handles.is_empty() {
            return Ok(());
        }
        let _freeing = self.freeing.lock();
        if self.state.lock().epoch != epoch {
            return Ok(());
        }
        let mut first_err = None;
        for handle in &handles {
            if let Err(err) = self.storage.destroy(*handle) {
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = self.storage.flush() {
            first_err.get_or_insert(err);
        }
        tracing::trace!(target: "bpdict::cache", freed = handles.len(), "released retired handles");
        first_err.map_or(Ok(()), Err)
    }

    /// Opens a new version and keeps `nodes` reachable for every reader
    /// registered before it. Must run after the nodes replacing them are
    /// published, so readers of the new version cannot reach them.
    ///
    /// Handles no reader needs are freed right away.
    pub fn retire(&self, nodes: Vec<(StorageHandle, Arc<Node<K, V>>)>) -> Result<()> {
        let (epoch, freed) = {
            let mut state = self.state.lock();
            state.current += 1;
            let version = state.current;
            state
                .retired
                .extend(nodes.into_iter().map(|(handle, node)| Retired {
                    version,
                    handle,
                    node,
                }));
            (state.epoch, Self::purge(&mut state))
        };
        self.free(epoch, freed)
    }

    /// Forgets every retirement without freeing it, then runs `reset`, which
    /// is expected to release all of storage.
    pub fn reset_with(&self, reset: impl FnOnce() -> Result<()>) -> Result<()> {
        let _freeing = self.freeing.lock();
        {
            let mut state = self.state.lock();
            state.retired.clear();
            state.epoch += 1;
        }
        reset()
    }

    /// The snapshot of `handle` as seen by a reader registered at `version`, when
    /// the handle was destroyed after that reader started.
    pub fn lookup(&self, handle: StorageHandle, version: u64) -> Option<Arc<Node<K, V>>> {
        let state = self.state.lock();
        state
            .retired
            .iter()
            .filter(|entry| entry.handle == handle && entry.version > version)
            .min_by_key(|entry| entry.version)
            .map(|entry| Arc::clone(&entry.node))
    }

    /// The most recently retired snapshot of `handle`, if any is still held.
    pub fn latest(&self, handle: StorageHandle) -> Option<Arc<Node<K, V>>> {
        let state = self.state.lock();
        state
            .retired
            .iter()
            .filter(|entry| entry.handle == handle)
            .max_by_key(|entry| entry.version)
            .map(|entry| Arc::clone(&entry.node))
    }

    #[cfg(test)]
    pub fn current(&self) -> u64 {
        self.state.lock().current
    }

    /// Number of retired nodes whose handles are still held back.
    #[cfg(test)]
    pub fn retained(&self) -> usize {
        self.state.lock().retired.len()
    }
}

/// A registered reader. Returning it (on drop) lets older snapshots be released.
pub(crate) struct NodeVersion<'h, K, V> {
    history: &'h VersionHistory<K, V>,
    version: u64,
}

impl<K, V> NodeVersion<'_, K, V> {
    pub fn id(&self) -> u64 {
        self.version
    }
}

impl<K, V> Drop for NodeVersion<'_, K, V> {
    fn drop(&mut self) {
        self.history.release(self.version);
    }
}
