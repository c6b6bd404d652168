use std::cmp::Ordering;

use super::BPlusTree;
use crate::primitives::concurrency::LockIntent;
use crate::storage::btree::codecs::{KeyCodec, ValCodec};
use crate::storage::btree::node::{Child, Node};
use crate::storage::btree::pin::NodePin;
use crate::storage::btree::transaction::NodeTransaction;
use crate::types::{Result, TreeError};

/// Pins held while descending to delete. `grand` is only kept while `parent`
/// is the top node, so a merge of the top's last two children can collapse it.
struct DeletePath<K, V> {
    grand: Option<NodePin<K, V>>,
    parent: NodePin<K, V>,
    parent_ix: usize,
    current: NodePin<K, V>,
}

impl<K, V> BPlusTree<K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    /// Removes `key`. Every node below the top that sits at its minimum is
    /// merged with or refilled from a sibling before the descent continues,
    /// so the final removal never underflows.
    pub(super) fn remove_entry(&self, key: &K) -> Result<Option<V>> {
        let cmp = self.comparer.as_ref();
        let root = self.cache.lock_root(LockIntent::Write, None)?;
        let top = self
            .cache
            .lock(root.node().child(0)?, LockIntent::Write, None)?;
        let mut path = DeletePath {
            grand: None,
            parent: root,
            parent_ix: 0,
            current: top,
        };
        loop {
            let is_top = path.parent.node().is_root;
            if !is_top && path.current.node().len() <= self.bounds(path.current.node()).min {
                path = self.rebalance(path, key)?;
            }
            if path.current.node().is_leaf() {
                let DeletePath {
                    grand,
                    parent,
                    current,
                    ..
                } = path;
                drop((grand, parent));
                return self.remove_from_leaf(current, key);
            }
            let ix = path.current.node().child_index(key, cmp)?;
            let child = self
                .cache
                .lock(path.current.node().child(ix)?, LockIntent::Write, None)?;
            tracing::trace!(
                target: "bpdict::btree::delete",
                node = %path.current.handle(),
                ix,
                "descend"
            );
            let DeletePath {
                grand,
                parent,
                current,
                ..
            } = path;
            drop(grand);
            let grand = if parent.node().is_root {
                Some(parent)
            } else {
                None
            };
            path = DeletePath {
                grand,
                parent: current,
                parent_ix: ix,
                current: child,
            };
        }
    }

    fn remove_from_leaf(&self, leaf: NodePin<K, V>, key: &K) -> Result<Option<V>> {
        let handle = leaf.handle();
        let Ok(ix) = leaf.node().search_leaf(key, self.comparer.as_ref())? else {
            tracing::trace!(target: "bpdict::btree::delete", leaf = %handle, "key not present");
            return Ok(None);
        };
        let mut txn = NodeTransaction::begin(&self.cache, self.journals.as_ref())?
            .begin_update(leaf)?;
        let values = txn.update_mut()?.values_mut()?;
        if ix >= values.len() {
            return Err(TreeError::Corruption("leaf ordinal out of range"));
        }
        let (_, value) = values.remove(ix);
        txn.commit()?;
        self.stats.inc_removes();
        self.adjust_count(false);
        tracing::trace!(target: "bpdict::btree::delete", leaf = %handle, "entry removed");
        Ok(Some(value))
    }

    /// Merges `path.current` with a sibling, or redistributes the pair, and
    /// returns the path re-pointed at the node now covering `key`.
    ///
    /// The right sibling is preferred; the rightmost child pairs with its left one.
    fn rebalance(&self, path: DeletePath<K, V>, key: &K) -> Result<DeletePath<K, V>> {
        let DeletePath {
            grand,
            parent,
            parent_ix,
            current,
        } = path;
        let siblings = parent.node().len();
        let (sibling_ix, current_is_left) = if parent_ix + 1 < siblings {
            (parent_ix + 1, true)
        } else {
            let left = parent_ix
                .checked_sub(1)
                .ok_or(TreeError::Corruption("internal node with a single child"))?;
            (left, false)
        };
        let sibling = self
            .cache
            .lock(parent.node().child(sibling_ix)?, LockIntent::Write, None)?;
        let (left, right, left_ix) = if current_is_left {
            (current, sibling, parent_ix)
        } else {
            (sibling, current, sibling_ix)
        };

        let separator = parent
            .node()
            .children()?
            .get(left_ix + 1)
            .and_then(|child| child.key.clone());
        let leaf = left.node().is_leaf();
        let mut combined = Node::clone(left.node());
        combined.append(Node::clone(right.node()), separator)?;
        let total = combined.len();
        let bounds = self.bounds(&combined);

        if total <= bounds.fill || (total <= bounds.max && total < 2 * bounds.min + 1) {
            if grand.is_some() && siblings == 2 {
                return self.collapse(grand, parent, left, right, combined);
            }
            return self.merge(grand, parent, left_ix, left, right, combined);
        }

        let half = (total + 1) / 2;
        let at = if self.comparer.compare(key, combined.key_at(half)?) == Ordering::Less {
            half
        } else {
            total / 2
        };
        let (separator, right_node) = combined.split_off(at)?;
        let go_right = self.comparer.compare(key, &separator) != Ordering::Less;
        let (old_left, old_right) = (left.handle(), right.handle());

        let mut txn = NodeTransaction::begin(&self.cache, self.journals.as_ref())?;
        let left_id = txn.create(combined)?;
        let right_id = txn.create(right_node)?;
        let left_handle = txn.created_handle(left_id)?;
        let right_handle = txn.created_handle(right_id)?;
        txn.destroy(left)?;
        txn.destroy(right)?;
        let mut txn = txn.begin_update(parent)?;
        let children = txn.update_mut()?.children_mut()?;
        children
            .get_mut(left_ix)
            .ok_or(TreeError::Corruption("parent ordinal out of range"))?
            .handle = left_handle;
        *children
            .get_mut(left_ix + 1)
            .ok_or(TreeError::Corruption("parent ordinal out of range"))? = Child {
            key: Some(separator),
            handle: right_handle,
        };
        let mut outcome = txn.commit()?;
        let parent = outcome.take_updated()?;
        let current = outcome.take_created(if go_right { right_id } else { left_id })?;
        self.stats.inc_redistributions();
        tracing::debug!(
            target: "bpdict::btree::delete",
            old_left = %old_left,
            old_right = %old_right,
            left = %left_handle,
            right = %right_handle,
            leaf,
            "redistributed siblings"
        );
        Ok(DeletePath {
            grand,
            parent,
            parent_ix: left_ix + usize::from(go_right),
            current,
        })
    }

    fn merge(
        &self,
        grand: Option<NodePin<K, V>>,
        parent: NodePin<K, V>,
        left_ix: usize,
        left: NodePin<K, V>,
        right: NodePin<K, V>,
        merged: Node<K, V>,
    ) -> Result<DeletePath<K, V>> {
        let leaf = merged.is_leaf();
        let (old_left, old_right) = (left.handle(), right.handle());
        let mut txn = NodeTransaction::begin(&self.cache, self.journals.as_ref())?;
        let merged_id = txn.create(merged)?;
        let merged_handle = txn.created_handle(merged_id)?;
        txn.destroy(left)?;
        txn.destroy(right)?;
        let mut txn = txn.begin_update(parent)?;
        let children = txn.update_mut()?.children_mut()?;
        if left_ix + 1 >= children.len() {
            return Err(TreeError::Corruption("parent ordinal out of range"));
        }
        children.remove(left_ix + 1);
        children[left_ix].handle = merged_handle;
        let mut outcome = txn.commit()?;
        let parent = outcome.take_updated()?;
        let current = outcome.take_created(merged_id)?;
        self.stats.inc_merges();
        tracing::debug!(
            target: "bpdict::btree::delete",
            left = %old_left,
            right = %old_right,
            merged = %merged_handle,
            leaf,
            "merged siblings"
        );
        Ok(DeletePath {
            grand,
            parent,
            parent_ix: left_ix,
            current,
        })
    }

    /// Merges the top node's last two children into a node that replaces the
    /// top. The pseudo-root link is the transaction's update.
    fn collapse(
        &self,
        grand: Option<NodePin<K, V>>,
        top: NodePin<K, V>,
        left: NodePin<K, V>,
        right: NodePin<K, V>,
        merged: Node<K, V>,
    ) -> Result<DeletePath<K, V>> {
        let root = grand.ok_or(TreeError::Protocol("collapse without the pseudo-root"))?;
        let old_top = top.handle();
        let mut txn = NodeTransaction::begin(&self.cache, self.journals.as_ref())?;
        let merged_id = txn.create(merged)?;
        let merged_handle = txn.created_handle(merged_id)?;
        txn.destroy(left)?;
        txn.destroy(right)?;
        txn.destroy(top)?;
        let mut txn = txn.begin_update(root)?;
        txn.update_mut()?
            .children_mut()?
            .first_mut()
            .ok_or(TreeError::Corruption("pseudo-root without child"))?
            .handle = merged_handle;
        let mut outcome = txn.commit()?;
        let root = outcome.take_updated()?;
        let current = outcome.take_created(merged_id)?;
        self.stats.inc_merges();
        self.stats.inc_root_collapses();
        tracing::debug!(
            target: "bpdict::btree::delete",
            old_top = %old_top,
            top = %merged_handle,
            "collapsed top node"
        );
        Ok(DeletePath {
            grand: None,
            parent: root,
            parent_ix: 0,
            current,
        })
    }
}
