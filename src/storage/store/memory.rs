use std::collections::HashMap;

use parking_lot::Mutex;

use super::NodeStorage;
use crate::types::{Result, StorageHandle, TreeError};

const ROOT_HANDLE: u64 = 1;

/// Volatile [`NodeStorage`] keeping node bytes in a hash map.
///
/// Freed handles are recycled. Nothing is journaled for this store.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

struct MemoryInner {
    next: u64,
    nodes: HashMap<u64, Vec<u8>>,
    free: Vec<u64>,
}

impl MemoryInner {
    fn empty() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_HANDLE, Vec::new());
        Self {
            next: ROOT_HANDLE + 1,
            nodes,
            free: Vec::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store holding only the root slot.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::empty()),
        }
    }

    /// Number of allocated handles, root included.
    pub fn allocated(&self) -> usize {
        self.inner.lock().nodes.len()
    }
}

impl NodeStorage for MemoryStore {
    fn open_root(&self) -> Result<(StorageHandle, bool)> {
        let mut inner = self.inner.lock();
        let root = inner.nodes.entry(ROOT_HANDLE).or_default();
        Ok((StorageHandle(ROOT_HANDLE), root.is_empty()))
    }

    fn create(&self) -> Result<StorageHandle> {
        let mut inner = self.inner.lock();
        let id = match inner.free.pop() {
            Some(id) => id,
            None => {
                let id = inner.next;
                inner.next = id
                    .checked_add(1)
                    .ok_or(TreeError::Invalid("handle space exhausted"))?;
                id
            }
        };
        inner.nodes.insert(id, Vec::new());
        Ok(StorageHandle(id))
    }

    fn destroy(&self, handle: StorageHandle) -> Result<()> {
        if handle.0 == ROOT_HANDLE {
            return Err(TreeError::Invalid("root handle cannot be destroyed"));
        }
        let mut inner = self.inner.lock();
        if inner.nodes.remove(&handle.0).is_none() {
            return Err(TreeError::Corruption("destroy of unallocated handle"));
        }
        inner.free.push(handle.0);
        Ok(())
    }

    fn try_get_node(&self, handle: StorageHandle) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().nodes.get(&handle.0).cloned())
    }

    fn write_node(&self, handle: StorageHandle, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.nodes.get_mut(&handle.0) {
            Some(slot) => {
                slot.clear();
                slot.extend_from_slice(bytes);
                Ok(())
            }
            None => Err(TreeError::Corruption("write to unallocated handle")),
        }
    }

    fn restore(&self, handle: StorageHandle, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.nodes.contains_key(&handle.0) {
            return Err(TreeError::Corruption("restored handle was reallocated"));
        }
        inner.free.retain(|id| *id != handle.0);
        inner.nodes.insert(handle.0, bytes.to_vec());
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        *self.inner.lock() = MemoryInner::empty();
        Ok(())
    }
}
