use std::sync::Arc;

use smallvec::SmallVec;

use super::cache::NodeSlot;
use super::codecs::{KeyCodec, ValCodec};
use super::node::Node;
use super::tree::{BPlusTree, MAX_DEPTH};
use super::version::NodeVersion;
use crate::primitives::concurrency::LockIntent;
use crate::types::{Result, TreeError};

/// The leaf a cursor is reading, with the slot stamp it had when loaded.
struct LeafSnapshot<K, V> {
    slot: Arc<NodeSlot<K, V>>,
    stamp: Option<u64>,
    node: Arc<Node<K, V>>,
    pos: usize,
}

impl<K, V> LeafSnapshot<K, V> {
    fn is_fresh(&self) -> bool {
        self.stamp.is_some_and(|stamp| stamp == self.slot.stamp())
    }
}

/// An in-order iterator over a tree that tolerates concurrent writers.
///
/// The cursor reads an immutable snapshot of one leaf at a time. While that
/// leaf is unchanged it keeps yielding from the snapshot; once it has been
/// rewritten or destroyed, the cursor seeks again for the first key after the
/// last one it yielded. Keys are therefore never repeated, and keys added
/// ahead of the cursor become visible.
pub struct Cursor<'t, K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    tree: &'t BPlusTree<K, V>,
    leaf: Option<LeafSnapshot<K, V>>,
    lower: Option<K>,
    last: Option<K>,
    version: Option<NodeVersion<'t, K, V>>,
    done: bool,
}

impl<'t, K, V> Cursor<'t, K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    pub(crate) fn new(tree: &'t BPlusTree<K, V>, lower: Option<K>) -> Self {
        Self {
            tree,
            leaf: None,
            lower,
            last: None,
            version: None,
            done: false,
        }
    }

    fn advance(&mut self) -> Result<Option<(K, V)>> {
        if let Some(leaf) = self.leaf.as_mut().filter(|leaf| leaf.is_fresh()) {
            if let Some((key, value)) = leaf.node.values()?.get(leaf.pos) {
                leaf.pos += 1;
                self.last = Some(key.clone());
                return Ok(Some((key.clone(), value.clone())));
            }
        }
        self.seek()
    }

    /// Descends from the root to the first key after the last yielded one (or
    /// at or after the lower bound before anything was yielded), climbing back
    /// up through the stack of visited internal nodes when a leaf has nothing left.
    fn seek(&mut self) -> Result<Option<(K, V)>> {
        self.leaf = None;
        self.version = None;
        let tree = self.tree;
        let cache = &tree.cache;
        let cmp = tree.comparer.as_ref();
        let _call = tree.call_guard(LockIntent::Read)?;
        let version = cache.versions().acquire();
        let (bound, inclusive) = match (&self.last, &self.lower) {
            (Some(last), _) => (Some(last), false),
            (None, Some(lower)) => (Some(lower), true),
            (None, None) => (None, true),
        };

        let mut stack: SmallVec<[(Arc<Node<K, V>>, usize); 8]> = SmallVec::new();
        let mut leftmost = false;
        let mut pin = cache.lock_root(LockIntent::Read, Some(&version))?;
        loop {
            let node = pin.snapshot()?;
            if !node.is_leaf() {
                let ix = match bound {
                    Some(bound) if !leftmost => node.child_index(bound, cmp)?,
                    _ => 0,
                };
                let child = node.child(ix)?;
                stack.push((node, ix));
                if stack.len() > MAX_DEPTH {
                    return Err(TreeError::Corruption("cursor exceeded the maximum tree depth"));
                }
                pin = cache.lock(child, LockIntent::Read, Some(&version))?;
                continue;
            }

            let pos = match bound {
                Some(bound) => match node.search_leaf(bound, cmp)? {
                    Ok(ix) if inclusive => ix,
                    Ok(ix) => ix + 1,
                    Err(ix) => ix,
                },
                None => 0,
            };
            if let Some((key, value)) = node.values()?.get(pos) {
                let item = (key.clone(), value.clone());
                tracing::trace!(
                    target: "bpdict::btree::search",
                    leaf = %pin.handle(),
                    pos,
                    depth = stack.len(),
                    "cursor positioned"
                );
                self.last = Some(item.0.clone());
                self.leaf = Some(LeafSnapshot {
                    slot: Arc::clone(pin.slot()),
                    stamp: pin.stamp(),
                    node,
                    pos: pos + 1,
                });
                self.version = Some(version);
                return Ok(Some(item));
            }

            let next = loop {
                let Some((parent, ix)) = stack.pop() else {
                    return Ok(None);
                };
                if ix + 1 < parent.len() {
                    let child = parent.child(ix + 1)?;
                    stack.push((parent, ix + 1));
                    break child;
                }
            };
            leftmost = true;
            pin = cache.lock(next, LockIntent::Read, Some(&version))?;
        }
    }
}

impl<K, V> Iterator for Cursor<'_, K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                self.leaf = None;
                self.version = None;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<K, V> std::fmt::Debug for Cursor<'_, K, V>
where
    K: KeyCodec + Clone + std::fmt::Debug,
    V: ValCodec + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("last", &self.last)
            .field("done", &self.done)
            .finish()
    }
}
