use std::collections::BTreeSet;
use std::io::IoSlice;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use parking_lot::Mutex;

use super::{CreatePolicy, NodeStorage, PersistentStorage};
use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::types::checksum::{block_crc32, header_crc32};
use crate::types::{Result, StorageHandle, TreeError};

const STORE_MAGIC: [u8; 4] = *b"BPDT";
const STORE_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;
const BLOCK_HDR_LEN: usize = 24;
const ROOT_BLOCK: u64 = 1;

/// Settings for [`FileStore::open`].
#[derive(Clone, Debug)]
pub struct FileStoreOptions {
    /// Size of one block in bytes, used when formatting a new file.
    pub block_size: u32,
    /// Number of blocks added each time the free list runs dry.
    pub growth_rate: u32,
    /// Number of file handles opened and used in rotation.
    pub concurrent_writers: u32,
    /// Whether and how a file is created.
    pub create_policy: CreatePolicy,
    /// Reject every mutation.
    pub read_only: bool,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            growth_rate: 100,
            concurrent_writers: 4,
            create_policy: CreatePolicy::IfNeeded,
            read_only: false,
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum BlockKind {
    Free = 0,
    Head = 1,
    Chain = 2,
}

impl TryFrom<u8> for BlockKind {
    type Error = TreeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BlockKind::Free),
            1 => Ok(BlockKind::Head),
            2 => Ok(BlockKind::Chain),
            _ => Err(TreeError::Corruption("unknown block kind")),
        }
    }
}

#[derive(Clone, Debug)]
struct BlockHeader {
    kind: BlockKind,
    len: u32,
    next: u64,
    total: u32,
    crc32: u32,
}

impl BlockHeader {
    fn new(kind: BlockKind, len: u32, next: u64, total: u32) -> Self {
        Self {
            kind,
            len,
            next,
            total,
            crc32: 0,
        }
    }

    fn encode(&self, block_no: u64, payload: &[u8]) -> [u8; BLOCK_HDR_LEN] {
        let mut buf = [0u8; BLOCK_HDR_LEN];
        buf[0] = self.kind as u8;
        buf[4..8].copy_from_slice(&self.len.to_be_bytes());
        buf[8..16].copy_from_slice(&self.next.to_be_bytes());
        buf[16..20].copy_from_slice(&self.total.to_be_bytes());
        let crc = block_crc32(block_no, &buf[..20], payload);
        buf[20..24].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < BLOCK_HDR_LEN {
            return Err(TreeError::Corruption("block header truncated"));
        }
        Ok(Self {
            kind: BlockKind::try_from(src[0])?,
            len: u32::from_be_bytes(read_array(&src[4..8])?),
            next: u64::from_be_bytes(read_array(&src[8..16])?),
            total: u32::from_be_bytes(read_array(&src[16..20])?),
            crc32: u32::from_be_bytes(read_array(&src[20..24])?),
        })
    }
}

fn read_array<const N: usize>(src: &[u8]) -> Result<[u8; N]> {
    src.try_into()
        .map_err(|_| TreeError::Corruption("short field"))
}

#[derive(Clone, Debug)]
struct FileHeader {
    block_size: u32,
    root: u64,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&STORE_MAGIC);
        buf[4..6].copy_from_slice(&STORE_FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.block_size.to_be_bytes());
        buf[12..20].copy_from_slice(&self.root.to_be_bytes());
        let crc = header_crc32(&buf[..28]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(TreeError::Corruption("store header truncated"));
        }
        if src[0..4] != STORE_MAGIC {
            return Err(TreeError::Corruption("store magic mismatch"));
        }
        let version = u16::from_be_bytes(read_array(&src[4..6])?);
        if version != STORE_FORMAT_VERSION {
            return Err(TreeError::Corruption("store format version mismatch"));
        }
        let stored_crc = u32::from_be_bytes(read_array(&src[28..32])?);
        if header_crc32(&src[..28]) != stored_crc {
            return Err(TreeError::Corruption("store header crc mismatch"));
        }
        Ok(Self {
            block_size: u32::from_be_bytes(read_array(&src[8..12])?),
            root: u64::from_be_bytes(read_array(&src[12..20])?),
        })
    }
}

struct FileInner {
    free: BTreeSet<u64>,
    block_count: u64,
}

/// [`NodeStorage`] over a file of fixed-size blocks.
///
/// Block 0 holds the file header. Every node occupies a chain of blocks whose
/// first block number is the node's handle. Each block carries its own crc32.
/// The free list lives in memory and is rebuilt on open by scanning block kinds.
pub struct FileStore {
    path: PathBuf,
    ios: Vec<StdFileIo>,
    next_io: AtomicUsize,
    block_size: u32,
    growth_rate: u32,
    read_only: bool,
    root: u64,
    inner: Mutex<FileInner>,
}

impl FileStore {
    /// Opens or formats the store at `path`.
    pub fn open(path: impl AsRef<Path>, options: &FileStoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if options.read_only && options.create_policy != CreatePolicy::Never {
            return Err(TreeError::Configuration {
                field: "read_only",
                reason: "read-only storage requires create policy never",
            });
        }
        let mode = match (options.read_only, options.create_policy) {
            (true, _) => OpenMode::ReadOnly,
            (false, CreatePolicy::Never) => OpenMode::Existing,
            (false, CreatePolicy::Always) => OpenMode::Truncate,
            (false, CreatePolicy::IfNeeded) => OpenMode::CreateIfMissing,
        };
        let primary = StdFileIo::open_with(&path, mode)?;
        let (block_size, root) = if primary.is_empty()? {
            if options.read_only {
                return Err(TreeError::Corruption("read-only store is empty"));
            }
            Self::format(&primary, options.block_size)?
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            primary.read_at(0, &mut buf)?;
            let header = FileHeader::decode(&buf)?;
            if header.block_size != options.block_size {
                tracing::debug!(
                    target: "bpdict::store",
                    stored = header.block_size,
                    requested = options.block_size,
                    "using block size recorded in file"
                );
            }
            (header.block_size, header.root)
        };
        let reopen = if options.read_only {
            OpenMode::ReadOnly
        } else {
            OpenMode::Existing
        };
        let mut ios = vec![primary];
        for _ in 1..options.concurrent_writers.max(1) {
            ios.push(StdFileIo::open_with(&path, reopen)?);
        }
        let mut store = Self {
            path,
            ios,
            next_io: AtomicUsize::new(0),
            block_size,
            growth_rate: options.growth_rate,
            read_only: options.read_only,
            root,
            inner: Mutex::new(FileInner {
                free: BTreeSet::new(),
                block_count: 0,
            }),
        };
        store.scan_free_blocks()?;
        Ok(store)
    }

    fn format(io: &StdFileIo, block_size: u32) -> Result<(u32, u64)> {
        if (block_size as usize) < FILE_HEADER_LEN.max(BLOCK_HDR_LEN * 2) {
            return Err(TreeError::Invalid("block size too small"));
        }
        let header = FileHeader {
            block_size,
            root: ROOT_BLOCK,
        };
        io.truncate(block_size as u64 * 2)?;
        io.write_at(0, &header.encode())?;
        let root_hdr = BlockHeader::new(BlockKind::Head, 0, 0, 0).encode(ROOT_BLOCK, &[]);
        io.write_at(block_size as u64 * ROOT_BLOCK, &root_hdr)?;
        io.sync_all()?;
        Ok((block_size, ROOT_BLOCK))
    }

    fn scan_free_blocks(&mut self) -> Result<()> {
        let len = self.io().len()?;
        let block_count = len / self.block_size as u64;
        let mut free = BTreeSet::new();
        let mut kind = [0u8; 1];
        for block in 1..block_count {
            self.io().read_at(self.block_offset(block), &mut kind)?;
            if BlockKind::try_from(kind[0])? == BlockKind::Free {
                free.insert(block);
            }
        }
        tracing::debug!(
            target: "bpdict::store",
            path = %self.path.display(),
            blocks = block_count,
            free = free.len(),
            "opened file store"
        );
        let inner = self.inner.get_mut();
        inner.free = free;
        inner.block_count = block_count;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block size recorded in the file.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of blocks currently on the free list.
    pub fn free_blocks(&self) -> usize {
        self.inner.lock().free.len()
    }

    fn io(&self) -> &StdFileIo {
        let idx = self.next_io.fetch_add(1, AtomicOrdering::Relaxed) % self.ios.len();
        &self.ios[idx]
    }

    fn block_offset(&self, block: u64) -> u64 {
        block * self.block_size as u64
    }

    fn payload_capacity(&self) -> usize {
        self.block_size as usize - BLOCK_HDR_LEN
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            Err(TreeError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn check_handle(&self, handle: StorageHandle) -> Result<()> {
        if handle.0 == 0 || handle.0 >= self.inner.lock().block_count {
            return Err(TreeError::Invalid("handle outside of store"));
        }
        Ok(())
    }

    fn read_header(&self, block: u64) -> Result<BlockHeader> {
        let mut buf = [0u8; BLOCK_HDR_LEN];
        self.io().read_at(self.block_offset(block), &mut buf)?;
        BlockHeader::decode(&buf)
    }

    fn write_block(&self, block: u64, header: &BlockHeader, payload: &[u8]) -> Result<()> {
        let hdr = header.encode(block, payload);
        self.io().writev_at(
            self.block_offset(block),
            &[IoSlice::new(&hdr), IoSlice::new(payload)],
        )
    }

    fn set_kind(&self, block: u64, kind: BlockKind) -> Result<()> {
        self.io().write_at(self.block_offset(block), &[kind as u8])
    }

    fn allocate_locked(&self, inner: &mut FileInner) -> Result<u64> {
        if let Some(block) = inner.free.pop_first() {
            return Ok(block);
        }
        let grow = u64::from(self.growth_rate.max(1));
        let first = inner.block_count;
        let new_count = first + grow;
        self.io().truncate(self.block_offset(new_count))?;
        inner.free.extend(first + 1..new_count);
        inner.block_count = new_count;
        tracing::trace!(target: "bpdict::store", blocks = new_count, "grew file store");
        Ok(first)
    }

    /// Follows the chain starting at `head`, returning every block number.
    fn chain(&self, head: u64, first: &BlockHeader) -> Result<Vec<u64>> {
        let limit = self.inner.lock().block_count;
        let mut blocks = vec![head];
        let mut next = first.next;
        while next != 0 {
            if next >= limit || blocks.len() as u64 > limit {
                return Err(TreeError::Corruption("block chain out of range"));
            }
            blocks.push(next);
            next = self.read_header(next)?.next;
        }
        Ok(blocks)
    }

    fn read_chain(&self, handle: StorageHandle, head: &BlockHeader) -> Result<Vec<u8>> {
        let limit = self.inner.lock().block_count;
        let mut out = Vec::with_capacity(head.total as usize);
        let mut buf = vec![0u8; self.block_size as usize];
        let mut block = handle.0;
        let mut expected = BlockKind::Head;
        let mut hops = 0u64;
        loop {
            self.io().read_at(self.block_offset(block), &mut buf)?;
            let header = BlockHeader::decode(&buf)?;
            if header.kind != expected {
                return Err(TreeError::Corruption("broken block chain"));
            }
            let len = header.len as usize;
            if len > self.payload_capacity() {
                return Err(TreeError::Corruption("block payload overflows block"));
            }
            let payload = &buf[BLOCK_HDR_LEN..BLOCK_HDR_LEN + len];
            let encoded = header.encode(block, payload);
            if encoded[20..24] != header.crc32.to_be_bytes() {
                return Err(TreeError::Corruption("block crc mismatch"));
            }
            out.extend_from_slice(payload);
            if header.next == 0 {
                break;
            }
            hops += 1;
            if header.next >= limit || hops > limit {
                return Err(TreeError::Corruption("block chain out of range"));
            }
            block = header.next;
            expected = BlockKind::Chain;
        }
        if out.len() != head.total as usize {
            return Err(TreeError::Corruption("node length mismatch"));
        }
        Ok(out)
    }

    fn live_head(&self, handle: StorageHandle) -> Result<BlockHeader> {
        self.check_handle(handle)?;
        let head = self.read_header(handle.0)?;
        match head.kind {
            BlockKind::Head => Ok(head),
            BlockKind::Free => Err(TreeError::Corruption("access to unallocated handle")),
            BlockKind::Chain => Err(TreeError::Corruption("handle names a continuation block")),
        }
    }

    fn free_chain(&self, handle: StorageHandle, head: &BlockHeader) -> Result<()> {
        let blocks = self.chain(handle.0, head)?;
        for block in &blocks {
            self.set_kind(*block, BlockKind::Free)?;
        }
        self.inner.lock().free.extend(blocks);
        Ok(())
    }
}

impl NodeStorage for FileStore {
    fn open_root(&self) -> Result<(StorageHandle, bool)> {
        let head = self.live_head(StorageHandle(self.root))?;
        Ok((StorageHandle(self.root), head.total == 0))
    }

    fn create(&self) -> Result<StorageHandle> {
        self.ensure_writable()?;
        let block = {
            let mut inner = self.inner.lock();
            self.allocate_locked(&mut inner)?
        };
        self.write_block(block, &BlockHeader::new(BlockKind::Head, 0, 0, 0), &[])?;
        Ok(StorageHandle(block))
    }

    fn destroy(&self, handle: StorageHandle) -> Result<()> {
        self.ensure_writable()?;
        if handle.0 == self.root {
            return Err(TreeError::Invalid("root handle cannot be destroyed"));
        }
        let head = self.live_head(handle)?;
        self.free_chain(handle, &head)
    }

    fn try_get_node(&self, handle: StorageHandle) -> Result<Option<Vec<u8>>> {
        self.check_handle(handle)?;
        let head = self.read_header(handle.0)?;
        match head.kind {
            BlockKind::Free => Ok(None),
            BlockKind::Chain => Err(TreeError::Corruption("handle names a continuation block")),
            BlockKind::Head => self.read_chain(handle, &head).map(Some),
        }
    }

    fn write_node(&self, handle: StorageHandle, bytes: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let head = self.live_head(handle)?;
        let total = u32::try_from(bytes.len()).map_err(|_| TreeError::Invalid("node too large"))?;
        let existing = self.chain(handle.0, &head)?;
        let cap = self.payload_capacity();
        let needed = bytes.len().div_ceil(cap).max(1);
        let mut blocks: Vec<u64> = existing.iter().copied().take(needed).collect();
        let surplus: Vec<u64> = existing.iter().copied().skip(needed).collect();
        if blocks.len() < needed {
            let mut inner = self.inner.lock();
            while blocks.len() < needed {
                blocks.push(self.allocate_locked(&mut inner)?);
            }
        }
        // Continuation blocks first so the head never points at a partial chain.
        for (idx, block) in blocks.iter().enumerate().rev() {
            let start = idx * cap;
            let end = (start + cap).min(bytes.len());
            let payload = &bytes[start.min(bytes.len())..end];
            let next = blocks.get(idx + 1).copied().unwrap_or(0);
            let header = if idx == 0 {
                BlockHeader::new(BlockKind::Head, payload.len() as u32, next, total)
            } else {
                BlockHeader::new(BlockKind::Chain, payload.len() as u32, next, 0)
            };
            self.write_block(*block, &header, payload)?;
        }
        if !surplus.is_empty() {
            for block in &surplus {
                self.set_kind(*block, BlockKind::Free)?;
            }
            self.inner.lock().free.extend(surplus);
        }
        Ok(())
    }

    fn restore(&self, handle: StorageHandle, bytes: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.check_handle(handle)?;
        if !self.inner.lock().free.remove(&handle.0) {
            return Err(TreeError::Corruption("restored handle was reallocated"));
        }
        self.write_block(handle.0, &BlockHeader::new(BlockKind::Head, 0, 0, 0), &[])?;
        self.write_node(handle, bytes)
    }

    fn reset(&self) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        let io = self.io();
        io.truncate(self.block_offset(self.root + 1))?;
        self.write_block(self.root, &BlockHeader::new(BlockKind::Head, 0, 0, 0), &[])?;
        inner.free.clear();
        inner.block_count = self.root + 1;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.ios[0].sync_all()
    }

    fn as_persistent(&self) -> Option<&dyn PersistentStorage> {
        Some(self)
    }
}

impl PersistentStorage for FileStore {
    fn rollback_create(&self, handle: StorageHandle) -> Result<()> {
        self.ensure_writable()?;
        self.check_handle(handle)?;
        let head = self.read_header(handle.0)?;
        if head.kind != BlockKind::Head {
            return Ok(());
        }
        self.free_chain(handle, &head)
    }

    fn rollback_delete(&self, handle: StorageHandle) -> Result<()> {
        self.ensure_writable()?;
        self.check_handle(handle)?;
        let head = self.read_header(handle.0)?;
        if head.kind == BlockKind::Head {
            return Ok(());
        }
        let blocks = self.chain(handle.0, &head)?;
        let mut inner = self.inner.lock();
        if blocks.iter().any(|b| !inner.free.contains(b)) {
            return Err(TreeError::Corruption("deleted chain was reallocated"));
        }
        for (idx, block) in blocks.iter().enumerate() {
            let kind = if idx == 0 {
                BlockKind::Head
            } else {
                BlockKind::Chain
            };
            self.set_kind(*block, kind)?;
            inner.free.remove(block);
        }
        Ok(())
    }

    fn rollback_update(&self, handle: StorageHandle, pre_image: &[u8]) -> Result<()> {
        self.write_node(handle, pre_image)
    }
}
