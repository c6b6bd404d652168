#![forbid(unsafe_code)]

//! Durable journal wrapping node transactions against persistent storage.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! [state: u32][check value: 16 bytes]
//! ([tag: u32][body len: u32][body][handle]) *
//! [EoF tag: u32][check value: 16 bytes]
//! ```
//!
//! The trailing EoF marker and check value are rewritten after every record,
//! so a record torn by a crash is recognised as incomplete on recovery.

mod factory;

pub use factory::{JournalFactory, JournalLease};

use std::path::{Path, PathBuf};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::storage::store::PersistentStorage;
use crate::types::{Result, StorageHandle, TreeError};

const CHECK_LEN: usize = 16;
const RECORDS_START: u64 = 4 + CHECK_LEN as u64;

/// Lifecycle state stored at offset 0 of a journal file.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JournalState {
    /// Header written, nothing recorded yet.
    Created = 0,
    /// Records appended; storage may be partially modified.
    Pending = 1,
    /// Commit in progress.
    Committing = 2,
    /// All recorded operations are durable.
    Committed = 3,
    /// Recorded operations were undone.
    RolledBack = 4,
    /// Journal released; contents are meaningless.
    Disposed = 5,
}

impl TryFrom<u32> for JournalState {
    type Error = TreeError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(JournalState::Created),
            1 => Ok(JournalState::Pending),
            2 => Ok(JournalState::Committing),
            3 => Ok(JournalState::Committed),
            4 => Ok(JournalState::RolledBack),
            5 => Ok(JournalState::Disposed),
            _ => Err(TreeError::Corruption("invalid journal state")),
        }
    }
}

/// Tag preceding every journal record.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// A handle was allocated.
    Create = 0x0dd1_0101,
    /// A handle is about to be freed.
    Delete = 0x0dd1_0202,
    /// A handle is about to be overwritten; the body is its pre-image.
    Update = 0x0dd1_0303,
    /// End of the record stream.
    EoF = 0x0dd1_0000,
}

impl TryFrom<u32> for EntryKind {
    type Error = TreeError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0x0dd1_0101 => Ok(EntryKind::Create),
            0x0dd1_0202 => Ok(EntryKind::Delete),
            0x0dd1_0303 => Ok(EntryKind::Update),
            0x0dd1_0000 => Ok(EntryKind::EoF),
            _ => Err(TreeError::Corruption("unknown journal entry tag")),
        }
    }
}

/// One decoded journal record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalRecord {
    /// What happened to the handle.
    pub kind: EntryKind,
    /// Affected handle.
    pub handle: StorageHandle,
    /// Pre-image for updates, empty otherwise.
    pub body: Vec<u8>,
}

/// A single journal file.
pub struct Journal {
    io: StdFileIo,
    path: PathBuf,
    check: [u8; CHECK_LEN],
    state: JournalState,
    position: u64,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("position", &self.position)
            .finish()
    }
}

impl Journal {
    /// Starts a fresh journal in `io`, overwriting whatever it held.
    pub fn begin(io: StdFileIo, path: PathBuf) -> Result<Self> {
        io.truncate(0)?;
        let mut journal = Self {
            io,
            path,
            check: rand::random(),
            state: JournalState::Created,
            position: RECORDS_START,
        };
        journal.write_state(JournalState::Created)?;
        journal.io.write_at(4, &journal.check)?;
        journal.write_trailer()?;
        journal.io.sync_all()?;
        Ok(journal)
    }

    /// Opens a journal left behind by an earlier process.
    pub fn open_existing(io: StdFileIo, path: PathBuf) -> Result<Self> {
        let mut header = [0u8; RECORDS_START as usize];
        io.read_at(0, &mut header)?;
        let state = JournalState::try_from(u32::from_be_bytes([
            header[0], header[1], header[2], header[3],
        ]))?;
        let mut check = [0u8; CHECK_LEN];
        check.copy_from_slice(&header[4..]);
        Ok(Self {
            io,
            path,
            check,
            state,
            position: RECORDS_START,
        })
    }

    /// Current state.
    pub fn state(&self) -> JournalState {
        self.state
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether storage may hold effects of an unfinished transaction.
    pub fn rollback_required(&self) -> bool {
        matches!(
            self.state,
            JournalState::Pending | JournalState::Committing
        )
    }

    fn write_state(&mut self, state: JournalState) -> Result<()> {
        self.io.write_at(0, &(state as u32).to_be_bytes())?;
        self.state = state;
        Ok(())
    }

    fn change_state(&mut self, state: JournalState) -> Result<()> {
        let allowed = match self.state {
            JournalState::Disposed => false,
            JournalState::RolledBack => state == JournalState::Disposed,
            _ => true,
        };
        if !allowed {
            return Err(TreeError::Protocol("journal state transition not allowed"));
        }
        self.write_state(state)?;
        self.io.sync_all()
    }

    fn write_trailer(&self) -> Result<()> {
        let mut trailer = Vec::with_capacity(4 + CHECK_LEN);
        trailer.extend_from_slice(&(EntryKind::EoF as u32).to_be_bytes());
        trailer.extend_from_slice(&self.check);
        self.io.write_at(self.position, &trailer)
    }

    /// Marks the journal as holding work in progress.
    pub fn join(&mut self) -> Result<()> {
        match self.state {
            JournalState::Created => self.change_state(JournalState::Pending),
            JournalState::Pending => Ok(()),
            _ => Err(TreeError::Protocol("journal is not accepting records")),
        }
    }

    /// Appends one record and makes it durable before the caller touches storage.
    pub fn append(
        &mut self,
        storage: &dyn PersistentStorage,
        kind: EntryKind,
        handle: StorageHandle,
        body: &[u8],
    ) -> Result<()> {
        if kind == EntryKind::EoF {
            return Err(TreeError::Invalid("EoF is not a record"));
        }
        self.join()?;
        let body_len =
            u32::try_from(body.len()).map_err(|_| TreeError::Invalid("journal body too large"))?;
        let mut record = Vec::with_capacity(8 + body.len() + StorageHandle::ENCODED_LEN);
        record.extend_from_slice(&(kind as u32).to_be_bytes());
        record.extend_from_slice(&body_len.to_be_bytes());
        record.extend_from_slice(body);
        storage.write_handle(handle, &mut record);
        self.io.write_at(self.position, &record)?;
        self.position += record.len() as u64;
        self.write_trailer()?;
        self.io.sync_all()
    }

    /// Moves a pending journal to `Committing`.
    pub fn begin_commit(&mut self) -> Result<()> {
        match self.state {
            JournalState::Pending => self.change_state(JournalState::Committing),
            _ => Err(TreeError::Protocol("journal is not pending")),
        }
    }

    /// Records that every operation is durable.
    pub fn complete_commit(&mut self) -> Result<()> {
        match self.state {
            JournalState::Committing => self.change_state(JournalState::Committed),
            _ => Err(TreeError::Protocol("journal is not committing")),
        }
    }

    /// Records that the transaction was undone. Repeated calls are no-ops.
    pub fn mark_rolled_back(&mut self) -> Result<()> {
        match self.state {
            JournalState::RolledBack | JournalState::Disposed => Ok(()),
            _ => self.change_state(JournalState::RolledBack),
        }
    }

    /// Marks the file as released.
    pub fn dispose(&mut self) -> Result<()> {
        match self.state {
            JournalState::Disposed => Ok(()),
            _ => self.change_state(JournalState::Disposed),
        }
    }

    /// Decodes every complete record. A torn tail ends the stream.
    pub fn records(&self, storage: &dyn PersistentStorage) -> Result<Vec<JournalRecord>> {
        let len = self.io.len()?;
        let mut bytes = vec![0u8; len as usize];
        self.io.read_at(0, &mut bytes)?;
        let mut records = Vec::new();
        let mut pos = RECORDS_START as usize;
        loop {
            let Some(tag) = read_u32(&bytes, pos) else {
                break;
            };
            let kind = match EntryKind::try_from(tag) {
                Ok(kind) => kind,
                Err(_) => break,
            };
            if kind == EntryKind::EoF {
                if bytes.get(pos + 4..pos + 4 + CHECK_LEN) != Some(&self.check[..]) {
                    return Err(TreeError::Corruption("journal check value mismatch"));
                }
                return Ok(records);
            }
            let Some(body_len) = read_u32(&bytes, pos + 4) else {
                break;
            };
            let body_start = pos + 8;
            let body_end = body_start + body_len as usize;
            let Some(body) = bytes.get(body_start..body_end) else {
                break;
            };
            let Some(rest) = bytes.get(body_end..) else {
                break;
            };
            let (handle, used) = match storage.read_handle(rest) {
                Ok(found) => found,
                Err(_) => break,
            };
            records.push(JournalRecord {
                kind,
                handle,
                body: body.to_vec(),
            });
            pos = body_end + used;
        }
        tracing::warn!(
            target: "bpdict::journal",
            path = %self.path.display(),
            complete = records.len(),
            "journal tail is torn"
        );
        Ok(records)
    }

    /// Undoes every recorded operation in reverse order and marks the journal rolled back.
    pub fn replay_rollback(&mut self, storage: &dyn PersistentStorage) -> Result<usize> {
        if !self.rollback_required() {
            return Ok(0);
        }
        let records = self.records(storage)?;
        for record in records.iter().rev() {
            match record.kind {
                EntryKind::Create => storage.rollback_create(record.handle)?,
                EntryKind::Delete => storage.rollback_delete(record.handle)?,
                EntryKind::Update => storage.rollback_update(record.handle, &record.body)?,
                EntryKind::EoF => {}
            }
        }
        storage.flush()?;
        self.mark_rolled_back()?;
        tracing::info!(
            target: "bpdict::journal",
            path = %self.path.display(),
            records = records.len(),
            "rolled back unfinished transaction"
        );
        Ok(records.len())
    }
}

fn read_u32(bytes: &[u8], pos: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(pos..pos + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}
