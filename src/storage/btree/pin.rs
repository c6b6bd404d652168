use std::sync::Arc;

use super::cache::NodeSlot;
use super::node::Node;
use crate::primitives::concurrency::{LockGuard, LockIntent};
use crate::types::{Result, StorageHandle, TreeError};

enum PinState<K, V> {
    Committed(Arc<Node<K, V>>),
    /// A private copy being edited by a transaction. `original` is `None` for
    /// nodes created by that transaction.
    Pending {
        original: Option<Arc<Node<K, V>>>,
        node: Node<K, V>,
    },
}

/// A locked reference to one node. The lock is released when the pin drops.
pub(crate) struct NodePin<K, V> {
    handle: StorageHandle,
    slot: Arc<NodeSlot<K, V>>,
    intent: LockIntent,
    stamp: Option<u64>,
    state: PinState<K, V>,
    _guard: LockGuard,
}

impl<K, V> NodePin<K, V> {
    pub(crate) fn committed(
        handle: StorageHandle,
        slot: Arc<NodeSlot<K, V>>,
        intent: LockIntent,
        guard: LockGuard,
        node: Arc<Node<K, V>>,
        stamp: Option<u64>,
    ) -> Self {
        Self {
            handle,
            slot,
            intent,
            stamp,
            state: PinState::Committed(node),
            _guard: guard,
        }
    }

    pub(crate) fn created(
        handle: StorageHandle,
        slot: Arc<NodeSlot<K, V>>,
        guard: LockGuard,
        node: Node<K, V>,
    ) -> Self {
        Self {
            handle,
            slot,
            intent: LockIntent::Write,
            stamp: None,
            state: PinState::Pending {
                original: None,
                node,
            },
            _guard: guard,
        }
    }

    pub fn handle(&self) -> StorageHandle {
        self.handle
    }

    pub fn intent(&self) -> LockIntent {
        self.intent
    }

    pub fn slot(&self) -> &Arc<NodeSlot<K, V>> {
        &self.slot
    }

    /// Stamp of the slot when this node was loaded or published; `None` for
    /// retired snapshots and unpublished nodes.
    pub fn stamp(&self) -> Option<u64> {
        self.stamp
    }

    /// The node as this pin sees it, including uncommitted edits.
    pub fn node(&self) -> &Node<K, V> {
        match &self.state {
            PinState::Committed(node) => node,
            PinState::Pending { node, .. } => node,
        }
    }

    /// The committed node, if nothing is pending.
    pub fn snapshot(&self) -> Result<Arc<Node<K, V>>> {
        match &self.state {
            PinState::Committed(node) => Ok(Arc::clone(node)),
            PinState::Pending { .. } => Err(TreeError::Protocol("node has pending changes")),
        }
    }

    /// The committed node an update started from.
    pub fn original(&self) -> Option<&Arc<Node<K, V>>> {
        match &self.state {
            PinState::Committed(node) => Some(node),
            PinState::Pending { original, .. } => original.as_ref(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, PinState::Pending { .. })
    }

    pub fn node_mut(&mut self) -> Result<&mut Node<K, V>> {
        match &mut self.state {
            PinState::Pending { node, .. } => Ok(node),
            PinState::Committed(_) => Err(TreeError::Protocol("node is not being updated")),
        }
    }

    /// Starts a private copy of the committed node.
    pub fn begin_update(&mut self) -> Result<()>
    where
        K: Clone,
        V: Clone,
    {
        if self.intent == LockIntent::Read {
            return Err(TreeError::Protocol("cannot update a read-locked node"));
        }
        match &self.state {
            PinState::Committed(node) => {
                let original = Arc::clone(node);
                let copy = Node::clone(&original);
                self.state = PinState::Pending {
                    original: Some(original),
                    node: copy,
                };
                Ok(())
            }
            PinState::Pending { .. } => Err(TreeError::Protocol("node is already being updated")),
        }
    }

    /// Makes the pending copy the committed node and publishes it to the slot.
    pub fn publish(&mut self) {
        if let PinState::Pending { node, .. } = &mut self.state {
            let empty = node.empty_like();
            let committed = Arc::new(std::mem::replace(node, empty));
            self.stamp = Some(self.slot.publish(Arc::clone(&committed)));
            self.state = PinState::Committed(committed);
        }
    }

    /// Discards the pending copy of an updated node.
    pub fn cancel(&mut self) {
        if let PinState::Pending {
            original: Some(original),
            ..
        } = &self.state
        {
            self.state = PinState::Committed(Arc::clone(original));
        }
    }
}
