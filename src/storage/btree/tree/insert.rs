use std::cmp::Ordering;

use super::BPlusTree;
use crate::primitives::concurrency::LockIntent;
use crate::storage::btree::codecs::{KeyCodec, ValCodec};
use crate::storage::btree::node::{Child, Node};
use crate::storage::btree::pin::NodePin;
use crate::storage::btree::transaction::NodeTransaction;
use crate::types::{Result, TreeError};

/// What [`BPlusTree::add_or_update`] did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    /// A new entry was added.
    Inserted,
    /// An existing entry was overwritten.
    Updated,
}

type Descent<K, V> = (NodePin<K, V>, usize, NodePin<K, V>);

impl<K, V> BPlusTree<K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    /// Inserts `key`, splitting every full node on the way down so the leaf
    /// always has room. Returns `None` when the key exists and `allow_update` is false.
    pub(super) fn insert_entry(
        &self,
        key: K,
        value: V,
        allow_update: bool,
    ) -> Result<Option<InsertOutcome>> {
        let cmp = self.comparer.as_ref();
        let mut parent = self.cache.lock_root(LockIntent::Write, None)?;
        let mut parent_ix = 0;
        let mut current = self
            .cache
            .lock(parent.node().child(0)?, LockIntent::Write, None)?;
        loop {
            if current.node().len() >= self.bounds(current.node()).max {
                (parent, parent_ix, current) = self.split(parent, parent_ix, current, &key)?;
            }
            if current.node().is_leaf() {
                drop(parent);
                return self.insert_into_leaf(current, key, value, allow_update);
            }
            let ix = current.node().child_index(&key, cmp)?;
            let child = self
                .cache
                .lock(current.node().child(ix)?, LockIntent::Write, None)?;
            tracing::trace!(
                target: "bpdict::btree::insert",
                node = %current.handle(),
                ix,
                "descend"
            );
            parent = current;
            parent_ix = ix;
            current = child;
        }
    }

    /// Replaces the halves of the full node `current` with two new nodes and
    /// links them from `parent`. When `parent` is the pseudo-root, a new top
    /// node holding both halves is created instead.
    ///
    /// Returns the new parent, the ordinal of the half that covers `key`, and that half.
    fn split(
        &self,
        parent: NodePin<K, V>,
        parent_ix: usize,
        current: NodePin<K, V>,
        key: &K,
    ) -> Result<Descent<K, V>> {
        let leaf = current.node().is_leaf();
        let mut prev = Node::clone(current.node());
        let at = prev.len() / 2;
        let (separator, next) = prev.split_off(at)?;
        let go_next = self.comparer.compare(key, &separator) != Ordering::Less;
        let old = current.handle();

        let mut txn = NodeTransaction::begin(&self.cache, self.journals.as_ref())?;
        let prev_id = txn.create(prev)?;
        let next_id = txn.create(next)?;
        let prev_handle = txn.created_handle(prev_id)?;
        let next_handle = txn.created_handle(next_id)?;
        txn.destroy(current)?;

        if parent.node().is_root {
            let mut top = Node::new_internal();
            top.children_mut()?.extend([
                Child {
                    key: None,
                    handle: prev_handle,
                },
                Child {
                    key: Some(separator),
                    handle: next_handle,
                },
            ]);
            let top_id = txn.create(top)?;
            let top_handle = txn.created_handle(top_id)?;
            let mut txn = txn.begin_update(parent)?;
            txn.update_mut()?
                .children_mut()?
                .first_mut()
                .ok_or(TreeError::Corruption("pseudo-root without child"))?
                .handle = top_handle;
            let mut outcome = txn.commit()?;
            drop(outcome.take_updated()?);
            let top = outcome.take_created(top_id)?;
            let half = outcome.take_created(if go_next { next_id } else { prev_id })?;
            self.stats.inc_root_splits();
            self.stats.inc_splits(leaf);
            tracing::debug!(
                target: "bpdict::btree::insert",
                old = %old,
                top = %top_handle,
                prev = %prev_handle,
                next = %next_handle,
                leaf,
                "split root"
            );
            return Ok((top, usize::from(go_next), half));
        }

        let mut txn = txn.begin_update(parent)?;
        let children = txn.update_mut()?.children_mut()?;
        children
            .get_mut(parent_ix)
            .ok_or(TreeError::Corruption("parent ordinal out of range"))?
            .handle = prev_handle;
        children.insert(
            parent_ix + 1,
            Child {
                key: Some(separator),
                handle: next_handle,
            },
        );
        let mut outcome = txn.commit()?;
        let parent = outcome.take_updated()?;
        let half = outcome.take_created(if go_next { next_id } else { prev_id })?;
        self.stats.inc_splits(leaf);
        tracing::debug!(
            target: "bpdict::btree::insert",
            old = %old,
            parent = %parent.handle(),
            prev = %prev_handle,
            next = %next_handle,
            leaf,
            "split node"
        );
        Ok((parent, parent_ix + usize::from(go_next), half))
    }

    fn insert_into_leaf(
        &self,
        leaf: NodePin<K, V>,
        key: K,
        value: V,
        allow_update: bool,
    ) -> Result<Option<InsertOutcome>> {
        let handle = leaf.handle();
        let position = leaf.node().search_leaf(&key, self.comparer.as_ref())?;
        if position.is_ok() && !allow_update {
            tracing::trace!(target: "bpdict::btree::insert", leaf = %handle, "duplicate key");
            return Ok(None);
        }
        if position.is_err() && leaf.node().len() >= self.leaf_bounds.max {
            return Err(TreeError::Corruption("leaf full after eager split"));
        }

        let mut txn = NodeTransaction::begin(&self.cache, self.journals.as_ref())?

            .begin_update(leaf)?;
        let values = txn.update_mut()?.values_mut()?;
        let outcome = match position {
            Ok(ix) => {
                *values
                    .get_mut(ix)
                    .ok_or(TreeError::Corruption("leaf ordinal out of range"))? = (key, value);
                InsertOutcome::Updated
            }
            Err(ix) => {
                values.insert(ix, (key, value));
                InsertOutcome::Inserted
            }
        };
        txn.commit()?;

        match outcome {
            InsertOutcome::Inserted => {
                self.stats.inc_inserts();
                self.adjust_count(true);
            }
            InsertOutcome::Updated => self.stats.inc_updates(),
        }
        tracing::trace!(target: "bpdict::btree::insert", leaf = %handle, ?outcome, "leaf written");
        Ok(Some(outcome))
    }

    /// Replaces the value under `key` with `f(old)` when `f` returns a value.
    pub(super) fn update_entry<F>(&self, key: &K, f: F) -> Result<bool>
    where
        F: FnOnce(&V) -> Option<V>,
    {
        let cmp = self.comparer.as_ref();
        let mut current = self.cache.lock_root(LockIntent::Write, None)?;
        while !current.node().is_leaf() {
            let ix = current.node().child_index(key, cmp)?;
            current = self
                .cache
                .lock(current.node().child(ix)?, LockIntent::Write, None)?;
        }
        let Ok(ix) = current.node().search_leaf(key, cmp)? else {
            return Ok(false);
        };
        let replacement = match current.node().values()?.get(ix) {
            Some((_, old)) => f(old),
            None => return Err(TreeError::Corruption("leaf ordinal out of range")),
        };
        let Some(replacement) = replacement else {
            return Ok(false);
        };
        let handle = current.handle();
        let mut txn = NodeTransaction::begin(&self.cache, self.journals.as_ref())?
            .begin_update(current)?;
        txn.update_mut()?
            .values_mut()?
            .get_mut(ix)
            .ok_or(TreeError::Corruption("leaf ordinal out of range"))?
            .1 = replacement;
        txn.commit()?;
        self.stats.inc_updates();
        tracing::trace!(target: "bpdict::btree::insert", leaf = %handle, "value updated");
        Ok(true)
    }
}
