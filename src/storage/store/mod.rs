#![forbid(unsafe_code)]

//! Handle-based node storage consumed by the tree.
//!
//! A store hands out opaque [`StorageHandle`]s and keeps raw node bytes per
//! handle. The node cache serializes all access to one handle through its
//! per-node locks, so a store only needs atomic handle allocation.

mod file;
mod memory;

pub use file::{FileStore, FileStoreOptions};
pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};

use crate::types::{Result, StorageHandle};

/// Which backend an options block selects.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Volatile in-process storage.
    #[default]
    Memory,
    /// Fixed-block file storage.
    Disk,
    /// A caller-supplied [`NodeStorage`].
    Custom,
}

/// What to do with the backing file when a disk store opens.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatePolicy {
    /// The file must already exist.
    #[default]
    Never,
    /// Always start from an empty file.
    Always,
    /// Create the file when it does not exist.
    IfNeeded,
}

/// Storage contract required by the node cache.
pub trait NodeStorage: Send + Sync {
    /// Returns the fixed handle of the root node and whether it was just created.
    fn open_root(&self) -> Result<(StorageHandle, bool)>;

    /// Allocates a new, empty slot.
    fn create(&self) -> Result<StorageHandle>;

    /// Frees `handle`. The root handle cannot be destroyed.
    fn destroy(&self, handle: StorageHandle) -> Result<()>;

    /// Reads the bytes stored under `handle`, or `None` when nothing is allocated there.
    fn try_get_node(&self, handle: StorageHandle) -> Result<Option<Vec<u8>>>;

    /// Replaces the bytes stored under an allocated `handle`.
    fn write_node(&self, handle: StorageHandle, bytes: &[u8]) -> Result<()>;

    /// Re-allocates a handle freed by [`destroy`](Self::destroy) and stores `bytes` in it.
    ///
    /// Fails with a corruption error when the handle was handed out again in the meantime.
    fn restore(&self, handle: StorageHandle, bytes: &[u8]) -> Result<()>;

    /// Frees every handle except the root and empties the root slot.
    fn reset(&self) -> Result<()>;

    /// Makes previous writes durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Returns the journaling capability when the store is durable.
    fn as_persistent(&self) -> Option<&dyn PersistentStorage> {
        None
    }
}

/// Capability of durable stores whose operations can be journaled and undone.
pub trait PersistentStorage: NodeStorage {
    /// Appends the serialized form of `handle` to `out`.
    fn write_handle(&self, handle: StorageHandle, out: &mut Vec<u8>) {
        handle.encode(out);
    }

    /// Reads a handle written by [`write_handle`](Self::write_handle), returning it
    /// with the number of bytes consumed.
    fn read_handle(&self, src: &[u8]) -> Result<(StorageHandle, usize)> {
        Ok((StorageHandle::decode(src)?, StorageHandle::ENCODED_LEN))
    }

    /// Undoes an allocation. Already-free handles are left alone.
    fn rollback_create(&self, handle: StorageHandle) -> Result<()>;

    /// Undoes a destroy, bringing back the slot's previous contents.
    fn rollback_delete(&self, handle: StorageHandle) -> Result<()>;

    /// Undoes an overwrite by writing back the recorded pre-image.
    fn rollback_update(&self, handle: StorageHandle, pre_image: &[u8]) -> Result<()>;
}
