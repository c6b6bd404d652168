//! Atomic groups of node creations, deletions and at most one in-place update.
//!
//! A transaction starts [`Idle`]. [`NodeTransaction::begin_update`] consumes it
//! and returns an [`Updating`] transaction, so a second update slot cannot be
//! opened. Commit order: created nodes, then the updated node, with the
//! journal (when present) recording every step first. Deleted nodes are
//! retired after publication; their handles are freed once no older reader
//! can still reach them.

use std::marker::PhantomData;

use super::cache::NodeCache;
use super::codecs::{KeyCodec, ValCodec};
use super::node::Node;
use super::pin::NodePin;
use crate::primitives::concurrency::LockIntent;
use crate::primitives::journal::{EntryKind, JournalFactory, JournalLease};
use crate::types::{Result, StorageHandle, TreeError};

/// No node has been opened for update yet.
pub(crate) struct Idle;
/// The single update slot is in use.
pub(crate) struct Updating;

/// Index of a node created in a transaction.
#[derive(Copy, Clone, Debug)]
pub(crate) struct CreatedId(usize);

/// Pins handed back by a successful commit, still locked.
pub(crate) struct CommitOutcome<K, V> {
    created: Vec<Option<NodePin<K, V>>>,
    updated: Option<NodePin<K, V>>,
}

impl<K, V> CommitOutcome<K, V> {
    pub fn take_created(&mut self, id: CreatedId) -> Result<NodePin<K, V>> {
        self.created
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(TreeError::Protocol("created node already taken"))
    }

    pub fn take_updated(&mut self) -> Result<NodePin<K, V>> {
        self.updated
            .take()
            .ok_or(TreeError::Protocol("transaction had no update"))
    }
}

#[derive(Default)]
struct Progress {
    update_attempted: bool,
}

struct TxnCore<'c, K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    cache: &'c NodeCache<K, V>,
    journal: Option<JournalLease>,
    created: Vec<NodePin<K, V>>,
    deleted: Vec<NodePin<K, V>>,
    update: Option<NodePin<K, V>>,
    finished: bool,
}

pub(crate) struct NodeTransaction<'c, K, V, S = Idle>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    core: TxnCore<'c, K, V>,
    _state: PhantomData<S>,
}

impl<'c, K, V> NodeTransaction<'c, K, V, Idle>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    /// Starts a transaction, leasing a journal when `journals` is set and the
    /// storage is persistent.
    pub fn begin(cache: &'c NodeCache<K, V>, journals: Option<&JournalFactory>) -> Result<Self> {
        let journal = match journals {
            Some(factory) if cache.storage().as_persistent().is_some() => Some(factory.lease()?),
            _ => None,
        };
        Ok(Self {
            core: TxnCore {
                cache,
                journal,
                created: Vec::new(),
                deleted: Vec::new(),
                update: None,
                finished: false,
            },
            _state: PhantomData,
        })
    }

    /// Opens `pin` as the transaction's single in-place update.
    pub fn begin_update(
        self,
        mut pin: NodePin<K, V>,
    ) -> Result<NodeTransaction<'c, K, V, Updating>> {
        let mut core = self.core;
        if core.deleted.iter().any(|deleted| deleted.handle() == pin.handle()) {
            return Err(TreeError::Protocol("cannot update a destroyed node"));
        }
        pin.begin_update()?;
        let handle = pin.handle();
        let pre_image = pin.original().map(|node| node.encode()).unwrap_or_default();
        core.update = Some(pin);
        core.record(EntryKind::Update, handle, &pre_image)?;
        Ok(NodeTransaction {
            core,
            _state: PhantomData,
        })
    }
}

impl<'c, K, V> NodeTransaction<'c, K, V, Updating>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    /// Mutable view of the node opened by `begin_update`.
    pub fn update_mut(&mut self) -> Result<&mut Node<K, V>> {
        self.core
            .update
            .as_mut()
            .ok_or(TreeError::Protocol("transaction has no update"))?
            .node_mut()
    }
}

impl<'c, K, V, S> NodeTransaction<'c, K, V, S>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    /// Allocates a handle for `node` and adds it to the created set.
    pub fn create(&mut self, node: Node<K, V>) -> Result<CreatedId> {
        let pin = self.core.cache.create_pin(node)?;
        let handle = pin.handle();
        self.core.created.push(pin);
        self.core.record(EntryKind::Create, handle, &[])?;
        Ok(CreatedId(self.core.created.len() - 1))
    }

    pub fn created_handle(&self, id: CreatedId) -> Result<StorageHandle> {
        self.core
            .created
            .get(id.0)
            .map(NodePin::handle)
            .ok_or(TreeError::Protocol("unknown created node"))
    }

    /// Marks the node behind `pin` for destruction at commit.
    pub fn destroy(&mut self, pin: NodePin<K, V>) -> Result<()> {
        if pin.intent() == LockIntent::Read {
            return Err(TreeError::Protocol("cannot destroy a read-locked node"));
        }
        if pin.is_pending() {
            return Err(TreeError::Protocol("cannot destroy a node with pending changes"));
        }
        let handle = pin.handle();
        let already = self.core.deleted.iter().any(|p| p.handle() == handle)
            || self.core.update.as_ref().is_some_and(|p| p.handle() == handle);
        if already {
            return Err(TreeError::Protocol("node already part of this transaction"));
        }
        self.core.record(EntryKind::Delete, handle, &[])?;
        pin.slot().set_destroyed(true);
        self.core.deleted.push(pin);
        Ok(())
    }

    /// Applies every change, or rolls all of them back and returns the error.
    pub fn commit(mut self) -> Result<CommitOutcome<K, V>> {
        self.core.commit()
    }

    /// Discards every change. Calling it again has no effect.
    pub fn rollback(&mut self) -> Result<()> {
        self.core.rollback()
    }
}

impl<K, V> TxnCore<'_, K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    fn record(&mut self, kind: EntryKind, handle: StorageHandle, body: &[u8]) -> Result<()> {
        if let (Some(journal), Some(storage)) =
            (self.journal.as_mut(), self.cache.storage().as_persistent())
        {
            journal.append(storage, kind, handle, body)?;
        }
        Ok(())
    }

    fn apply(&mut self, progress: &mut Progress) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.join()?;
            journal.begin_commit()?;
        }
        for pin in &self.created {
            self.cache.write(pin, pin.node())?;
        }
        if let Some(pin) = &self.update {
            progress.update_attempted = true;
            self.cache.write(pin, pin.node())?;
        }
        self.cache.storage().flush()?;
        if let Some(journal) = self.journal.as_mut() {
            journal.complete_commit()?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<CommitOutcome<K, V>> {
        if self.finished {
            return Err(TreeError::Protocol("transaction already finished"));
        }
        let retired = self
            .deleted
            .iter()
            .map(|pin| Ok((pin.handle(), pin.snapshot()?)))
            .collect::<Result<Vec<_>>>()?;
        let mut progress = Progress::default();
        if let Err(err) = self.apply(&mut progress) {
            tracing::debug!(target: "bpdict::txn", error = %err, "commit failed; rolling back");
            if let Err(undo_err) = self.undo(&progress) {
                tracing::warn!(
                    target: "bpdict::txn",
                    error = %undo_err,
                    "rollback after failed commit incomplete"
                );
            }
            return Err(err);
        }
        self.finished = true;

        let mut created = std::mem::take(&mut self.created);
        for pin in &mut created {
            pin.publish();
        }
        let mut updated = self.update.take();
        if let Some(pin) = updated.as_mut() {
            pin.publish();
        }
        let deleted = std::mem::take(&mut self.deleted);
        for pin in &deleted {
            self.cache.mark_destroyed(pin.handle(), pin.slot());
        }
        if let Err(err) = self.cache.versions().retire(retired) {
            tracing::warn!(target: "bpdict::txn", error = %err, "failed to free destroyed nodes");
        }
        self.cache.stats().inc_commits();
        tracing::debug!(
            target: "bpdict::txn",
            created = created.len(),
            deleted = deleted.len(),
            updated = updated.as_ref().map(|pin| pin.handle().0),
            "committed node transaction"
        );
        Ok(CommitOutcome {
            created: created.into_iter().map(Some).collect(),
            updated,
        })
    }

    /// Reverses the storage effects of a partially applied commit, then rolls back.
    fn undo(&mut self, progress: &Progress) -> Result<()> {
        let mut first_err = None;
        let cache = self.cache;
        let storage = cache.storage();
        if progress.update_attempted {
            if let Some(pin) = self.update.as_ref() {
                if let Some(original) = pin.original() {
                    if let Err(err) = storage.write_node(pin.handle(), &original.encode()) {
                        first_err.get_or_insert(err);
                    }
                }
                cache.discard(pin.handle(), pin.slot());
            }
            if let Err(err) = storage.flush() {
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = self.rollback_inner(first_err.is_none()) {
            first_err.get_or_insert(err);
        }
        first_err.map_or(Ok(()), Err)
    }

    fn rollback(&mut self) -> Result<()> {
        self.rollback_inner(true)
    }

    fn rollback_inner(&mut self, storage_clean: bool) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut first_err = None;
        for pin in self.created.drain(..) {
            self.cache.discard(pin.handle(), pin.slot());
            if let Err(err) = self.cache.storage().destroy(pin.handle()) {
                first_err.get_or_insert(err);
            }
        }
        if let Some(pin) = self.update.as_mut() {
            pin.cancel();
        }
        self.update = None;
        for pin in self.deleted.drain(..) {
            pin.slot().set_destroyed(false);
        }
        if let Some(journal) = self.journal.as_mut() {
            if storage_clean && first_err.is_none() {
                if let Err(err) = journal.mark_rolled_back() {
                    first_err.get_or_insert(err);
                }
            }
        }
        self.cache.stats().inc_rollbacks();
        tracing::debug!(
            target: "bpdict::txn",
            clean = first_err.is_none(),
            "rolled back node transaction"
        );
        first_err.map_or(Ok(()), Err)
    }
}

impl<K, V> Drop for TxnCore<'_, K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    fn drop(&mut self) {
        if let Err(err) = self.rollback() {
            tracing::warn!(target: "bpdict::txn", error = %err, "rollback on drop failed");
        }
    }
}
