use super::{BPlusTree, MAX_DEPTH};
use crate::primitives::concurrency::LockIntent;
use crate::storage::btree::codecs::{KeyCodec, ValCodec};
use crate::types::{Result, TreeError};

impl<K, V> BPlusTree<K, V>
where
    K: KeyCodec + Clone,
    V: ValCodec + Clone,
{
    /// Descends from the root to the leaf covering `key`.
    ///
    /// Each child is pinned before its parent is released. The reader's
    /// version keeps nodes destroyed mid-descent visible.
    pub(super) fn find(&self, key: &K) -> Result<Option<V>> {
        self.stats.inc_searches();
        let cmp = self.comparer.as_ref();
        let version = self.cache.versions().acquire();
        let mut pin = self.cache.lock_root(LockIntent::Read, Some(&version))?;
        for _ in 0..=MAX_DEPTH {
            let node = pin.node();
            if node.is_leaf() {
                let found = match node.search_leaf(key, cmp)? {
                    Ok(ix) => node.values()?.get(ix).map(|(_, value)| value.clone()),
                    Err(_) => None,
                };
                tracing::trace!(
                    target: "bpdict::btree::search",
                    leaf = %pin.handle(),
                    found = found.is_some(),
                    "search finished"
                );
                return Ok(found);
            }
            let ix = node.child_index(key, cmp)?;
            let child = node.child(ix)?;
            tracing::trace!(
                target: "bpdict::btree::search",
                node = %pin.handle(),
                ix,
                child = %child,
                "descend"
            );
            pin = self.cache.lock(child, LockIntent::Read, Some(&version))?;
        }
        Err(TreeError::Corruption("search exceeded the maximum tree depth"))
    }
}
