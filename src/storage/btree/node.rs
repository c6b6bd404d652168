//! In-memory node model and its byte layout.
//!
//! Layout, big-endian:
//!
//! ```text
//! [flags: u8][count: u32]
//! leaf entry:     [key len: u32][key][value len: u32][value]
//! internal entry: [has key: u8]([key len: u32][key])?[handle: u64]
//! ```

use std::cmp::Ordering;

use super::codecs::{KeyCodec, KeyComparer, ValCodec};
use crate::types::{Result, StorageHandle, TreeError};

const FLAG_LEAF: u8 = 0b01;
const FLAG_ROOT: u8 = 0b10;

/// One link of an internal node. The first link's key is always `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Child<K> {
    pub key: Option<K>,
    pub handle: StorageHandle,
}

/// Entries of a node, discriminated by node kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Entries<K, V> {
    Leaf(Vec<(K, V)>),
    Internal(Vec<Child<K>>),
}

/// One tree node. Committed nodes are shared behind `Arc` and never mutated;
/// a transaction edits a private copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Node<K, V> {
    pub is_root: bool,
    pub entries: Entries<K, V>,
}

impl<K, V> Node<K, V> {
    pub fn new_leaf() -> Self {
        Self {
            is_root: false,
            entries: Entries::Leaf(Vec::new()),
        }
    }

    pub fn new_internal() -> Self {
        Self {
            is_root: false,
            entries: Entries::Internal(Vec::new()),
        }
    }

    /// The pseudo-root: an internal node with a single child, the top of the tree.
    pub fn new_root(top: StorageHandle) -> Self {
        Self {
            is_root: true,
            entries: Entries::Internal(vec![Child {
                key: None,
                handle: top,
            }]),
        }
    }

    pub fn empty_like(&self) -> Self {
        match self.entries {
            Entries::Leaf(_) => Self::new_leaf(),
            Entries::Internal(_) => Self::new_internal(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.entries, Entries::Leaf(_))
    }

    pub fn len(&self) -> usize {
        match &self.entries {
            Entries::Leaf(values) => values.len(),
            Entries::Internal(children) => children.len(),
        }
    }

    pub fn values(&self) -> Result<&[(K, V)]> {
        match &self.entries {
            Entries::Leaf(values) => Ok(values),
            Entries::Internal(_) => Err(TreeError::Corruption("expected leaf node")),
        }
    }

    pub fn values_mut(&mut self) -> Result<&mut Vec<(K, V)>> {
        match &mut self.entries {
            Entries::Leaf(values) => Ok(values),
            Entries::Internal(_) => Err(TreeError::Corruption("expected leaf node")),
        }
    }

    pub fn children(&self) -> Result<&[Child<K>]> {
        match &self.entries {
            Entries::Internal(children) => Ok(children),
            Entries::Leaf(_) => Err(TreeError::Corruption("expected internal node")),
        }
    }

    pub fn children_mut(&mut self) -> Result<&mut Vec<Child<K>>> {
        match &mut self.entries {
            Entries::Internal(children) => Ok(children),
            Entries::Leaf(_) => Err(TreeError::Corruption("expected internal node")),
        }
    }

    pub fn child(&self, index: usize) -> Result<StorageHandle> {
        self.children()?
            .get(index)
            .map(|child| child.handle)
            .ok_or(TreeError::Corruption("child index out of range"))
    }

    /// Position of `key` in a leaf: `Ok` on exact match, `Err` with the
    /// insertion ordinal otherwise.
    pub fn search_leaf(
        &self,
        key: &K,
        cmp: &dyn KeyComparer<K>,
    ) -> Result<std::result::Result<usize, usize>> {
        Ok(self
            .values()?
            .binary_search_by(|(candidate, _)| cmp.compare(candidate, key)))
    }

    /// Index of the child covering `key`: the last link whose key is `<= key`, or 0.
    pub fn child_index(&self, key: &K, cmp: &dyn KeyComparer<K>) -> Result<usize> {
        let children = self.children()?;
        if children.is_empty() {
            return Err(TreeError::Corruption("internal node without children"));
        }
        Ok(children[1..].partition_point(|child| match &child.key {
            Some(sep) => cmp.compare(sep, key) != Ordering::Greater,
            None => true,
        }))
    }

    /// Splits off the entries from `at` into a new node of the same kind and
    /// returns it with its lower bound key.
    pub fn split_off(&mut self, at: usize) -> Result<(K, Self)>
    where
        K: Clone,
    {
        match &mut self.entries {
            Entries::Leaf(values) => {
                let right = values.split_off(at);
                let key = right
                    .first()
                    .map(|(key, _)| key.clone())
                    .ok_or(TreeError::Corruption("split produced an empty node"))?;
                Ok((
                    key,
                    Self {
                        is_root: false,
                        entries: Entries::Leaf(right),
                    },
                ))
            }
            Entries::Internal(children) => {
                if at == 0 {
                    return Err(TreeError::Corruption("split at the sentinel link"));
                }
                let mut right = children.split_off(at);
                let key = right
                    .first_mut()
                    .and_then(|child| child.key.take())
                    .ok_or(TreeError::Corruption("internal link without key"))?;
                Ok((
                    key,
                    Self {
                        is_root: false,
                        entries: Entries::Internal(right),
                    },
                ))
            }
        }
    }

    /// Appends `right` to this node. For internal nodes `separator` becomes the
    /// key of `right`'s first link.
    pub fn append(&mut self, right: Self, separator: Option<K>) -> Result<()> {
        match (&mut self.entries, right.entries) {
            (Entries::Leaf(values), Entries::Leaf(more)) => {
                values.extend(more);
                Ok(())
            }
            (Entries::Internal(children), Entries::Internal(mut more)) => {
                let first = more
                    .first_mut()
                    .ok_or(TreeError::Corruption("merging an empty internal node"))?;
                first.key = Some(separator.ok_or(TreeError::Corruption("missing separator key"))?);
                children.extend(more);
                Ok(())
            }
            _ => Err(TreeError::Corruption("merging nodes of different kinds")),
        }
    }

    /// Key of entry `index` used as a lower bound when the entries are split there.
    pub fn key_at(&self, index: usize) -> Result<&K> {
        let key = match &self.entries {
            Entries::Leaf(values) => values.get(index).map(|(key, _)| key),
            Entries::Internal(children) => children.get(index).and_then(|child| child.key.as_ref()),
        };
        key.ok_or(TreeError::Corruption("no key at split position"))
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.src.len())
            .ok_or(TreeError::Corruption("node bytes truncated"))?;
        let bytes = &self.src[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

impl<K: KeyCodec, V: ValCodec> Node<K, V> {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        let mut flags = 0u8;
        if self.is_leaf() {
            flags |= FLAG_LEAF;
        }
        if self.is_root {
            flags |= FLAG_ROOT;
        }
        out.push(flags);
        out.extend_from_slice(&(self.len() as u32).to_be_bytes());
        let mut scratch = Vec::new();
        match &self.entries {
            Entries::Leaf(values) => {
                for (key, value) in values {
                    scratch.clear();
                    K::encode_key(key, &mut scratch);
                    put_bytes(&mut out, &scratch);
                    scratch.clear();
                    V::encode_val(value, &mut scratch);
                    put_bytes(&mut out, &scratch);
                }
            }
            Entries::Internal(children) => {
                for child in children {
                    match &child.key {
                        Some(key) => {
                            out.push(1);
                            scratch.clear();
                            K::encode_key(key, &mut scratch);
                            put_bytes(&mut out, &scratch);
                        }
                        None => out.push(0),
                    }
                    child.handle.encode(&mut out);
                }
            }
        }
        out
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut reader = Reader { src, pos: 0 };
        let flags = reader.u8()?;
        if flags & !(FLAG_LEAF | FLAG_ROOT) != 0 {
            return Err(TreeError::Corruption("unknown node flags"));
        }
        let is_root = flags & FLAG_ROOT != 0;
        let count = reader.u32()? as usize;
        let entries = if flags & FLAG_LEAF != 0 {
            if is_root {
                return Err(TreeError::Corruption("root node cannot be a leaf"));
            }
            let mut values = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let key = K::decode_key(reader.prefixed()?)?;
                let value = V::decode_val(reader.prefixed()?)?;
                values.push((key, value));
            }
            Entries::Leaf(values)
        } else {
            let mut children = Vec::with_capacity(count.min(1024));
            for index in 0..count {
                let key = match reader.u8()? {
                    0 => None,
                    1 => Some(K::decode_key(reader.prefixed()?)?),
                    _ => return Err(TreeError::Corruption("invalid link key marker")),
                };
                if key.is_some() == (index == 0) {
                    return Err(TreeError::Corruption("misplaced sentinel link"));
                }
                let handle = StorageHandle::decode(reader.take(StorageHandle::ENCODED_LEN)?)?;
                children.push(Child { key, handle });
            }
            if children.is_empty() {
                return Err(TreeError::Corruption("internal node without children"));
            }
            Entries::Internal(children)
        };
        if reader.pos != src.len() {
            return Err(TreeError::Corruption("trailing bytes after node"));
        }
        Ok(Self { is_root, entries })
    }
}
