use std::cmp::Ordering;

use serde::Serialize;

use super::{BPlusTree, MAX_DEPTH};
use crate::primitives::concurrency::LockIntent;
use crate::storage::btree::codecs::{KeyCodec, KeyComparer, ValCodec};
use crate::types::{Result, StorageHandle, TreeError};

/// Shape of a tree as found by [`BPlusTree::validate`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TreeReport {
    /// Levels below the pseudo-root; a tree holding a single leaf has depth 1.
    pub depth: usize,
    /// Leaf nodes visited.
    pub leaves: u64,
    /// Internal nodes visited, excluding the pseudo-root.
    pub internals: u64,
    /// Entries stored in leaves.
    pub entries: u64,
}

struct Pending<K> {
    handle: StorageHandle,
    lower: Option<K>,
    upper: Option<K>,
    depth: usize,
}

fn below<K>(cmp: &dyn KeyComparer<K>, key: &K, upper: Option<&K>) -> bool {
    upper.map_or(true, |upper| cmp.compare(key, upper) == Ordering::Less)
}

fn at_or_above<K>(cmp: &dyn KeyComparer<K>, key: &K, lower: Option<&K>) -> bool {
    lower.map_or(true, |lower| cmp.compare(key, lower) != Ordering::Less)
}

impl<K, V> BPlusTree<K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    /// Visits every node under the pseudo-root with an explicit stack.
    ///
    /// Keys must ascend strictly and stay inside the bounds their parent
    /// separators give. All leaves must sit at the same depth. With
    /// `check_fill`, every node below the top must also respect its fill bounds.
    pub(super) fn walk(&self, check_fill: bool) -> Result<TreeReport> {
        let cmp = self.comparer.as_ref();
        let version = self.cache.versions().acquire();
        let root = self.cache.lock_root(LockIntent::Read, Some(&version))?;
        let root_node = root.node();
        if !root_node.is_root || root_node.len() != 1 {
            return Err(TreeError::Corruption("pseudo-root must hold exactly one link"));
        }
        let mut stack = vec![Pending {
            handle: root_node.child(0)?,
            lower: None,
            upper: None,
            depth: 1,
        }];
        drop(root);

        let mut report = TreeReport::default();
        let mut leaf_depth = None;
        while let Some(Pending {
            handle,
            lower,
            upper,
            depth,
        }) = stack.pop()
        {
            if depth > MAX_DEPTH {
                return Err(TreeError::Corruption("tree exceeds the maximum depth"));
            }
            let pin = self.cache.lock(handle, LockIntent::Read, Some(&version))?;
            let node = pin.node();
            if node.is_root {
                return Err(TreeError::Corruption("pseudo-root linked below the top"));
            }
            let bounds = self.bounds(node);
            if node.len() > bounds.max {
                return Err(TreeError::Corruption("node above its maximum"));
            }
            if check_fill && depth > 1 && node.len() < bounds.min {
                return Err(TreeError::Corruption("node below its minimum"));
            }
            report.depth = report.depth.max(depth);

            if node.is_leaf() {
                if *leaf_depth.get_or_insert(depth) != depth {
                    return Err(TreeError::Corruption("leaves at different depths"));
                }
                let values = node.values()?;
                for pair in values.windows(2) {
                    if cmp.compare(&pair[0].0, &pair[1].0) != Ordering::Less {
                        return Err(TreeError::Corruption("leaf keys out of order"));
                    }
                }
                if let (Some((first, _)), Some((last, _))) = (values.first(), values.last()) {
                    if !at_or_above(cmp, first, lower.as_ref())
                        || !below(cmp, last, upper.as_ref())
                    {
                        return Err(TreeError::Corruption("leaf key outside its separators"));
                    }
                }
                report.leaves += 1;
                report.entries += values.len() as u64;
                continue;
            }

            let children = node.children()?;
            if children.len() < 2 {
                return Err(TreeError::Corruption("internal node with fewer than two links"));
            }
            if children[0].key.is_some() {
                return Err(TreeError::Corruption("first link carries a key"));
            }
            let mut keys: Vec<&K> = Vec::with_capacity(children.len() - 1);
            for child in &children[1..] {
                let key = child
                    .key
                    .as_ref()
                    .ok_or(TreeError::Corruption("link without separator"))?;
                if !at_or_above(cmp, key, lower.as_ref()) || !below(cmp, key, upper.as_ref()) {
                    return Err(TreeError::Corruption("separator outside its parent bounds"));
                }
                if keys
                    .last()
                    .is_some_and(|prev| cmp.compare(prev, key) != Ordering::Less)
                {
                    return Err(TreeError::Corruption("separators out of order"));
                }
                keys.push(key);
            }
            for (ix, child) in children.iter().enumerate().rev() {
                let child_lower = match ix {
                    0 => lower.clone(),
                    _ => child.key.clone(),
                };
                let child_upper = match children.get(ix + 1) {
                    Some(next) => next.key.clone(),
                    None => upper.clone(),
                };
                stack.push(Pending {
                    handle: child.handle,
                    lower: child_lower,
                    upper: child_upper,
                    depth: depth + 1,
                });
            }
            report.internals += 1;
        }
        tracing::trace!(
            target: "bpdict::btree::search",
            depth = report.depth,
            leaves = report.leaves,
            entries = report.entries,
            "tree walked"
        );
        Ok(report)
    }
}
