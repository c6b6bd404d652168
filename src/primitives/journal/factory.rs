use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::Journal;
use crate::primitives::concurrency::DirectoryLock;
use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::storage::store::PersistentStorage;
use crate::types::{Result, TreeError};

const FILE_PREFIX: &str = "transaction.";
const MAX_POOL: usize = 64;

/// Owner of a journal directory and the pool of journal files inside it.
///
/// Opening a factory claims the directory, deletes finished journals and keeps
/// unfinished ones aside until [`recover`](Self::recover) replays them.
#[derive(Clone)]
pub struct JournalFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    dir: PathBuf,
    _lock: DirectoryLock,
    pool_size: usize,
    next_id: AtomicU32,
    pool: Mutex<PoolState>,
    returned: Condvar,
    leftovers: Mutex<Vec<Journal>>,
}

struct PoolState {
    idle: Vec<(StdFileIo, PathBuf)>,
    open: usize,
}

fn is_journal_name(name: &str) -> bool {
    name.strip_prefix(FILE_PREFIX)
        .is_some_and(|id| id.len() == 3 && id.bytes().all(|b| b.is_ascii_digit()))
}

fn quarantine(path: &Path) -> Result<PathBuf> {
    let mut index = 0u32;
    loop {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".corrupt{index:03}"));
        let target = PathBuf::from(name);
        if !target.exists() {
            fs::rename(path, &target)?;
            return Ok(target);
        }
        index += 1;
    }
}

impl JournalFactory {
    /// Opens `dir`, creating it when missing, with room for `pool_size` concurrent journals.
    pub fn open(dir: impl AsRef<Path>, pool_size: usize) -> Result<Self> {
        if !(1..=MAX_POOL).contains(&pool_size) {
            return Err(TreeError::Configuration {
                field: "journal_pool_size",
                reason: "must be between 1 and 64",
            });
        }
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let lock = DirectoryLock::acquire(dir)?;
        let dir = lock.path().to_path_buf();

        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if is_journal_name(name) {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();

        let mut leftovers = Vec::new();
        for name in names {
            let path = dir.join(&name);
            if fs::metadata(&path)?.len() == 0 {
                fs::remove_file(&path)?;
                continue;
            }
            let opened = StdFileIo::open_with(&path, OpenMode::Existing)
                .and_then(|io| Journal::open_existing(io, path.clone()));
            match opened {
                Ok(journal) if journal.rollback_required() => {
                    tracing::info!(
                        target: "bpdict::journal",
                        path = %path.display(),
                        state = ?journal.state(),
                        "found unfinished transaction"
                    );
                    leftovers.push(journal);
                }
                Ok(journal) => {
                    drop(journal);
                    fs::remove_file(&path)?;
                }
                Err(err) => {
                    let target = quarantine(&path)?;
                    tracing::error!(
                        target: "bpdict::journal",
                        path = %path.display(),
                        moved_to = %target.display(),
                        error = %err,
                        "unable to recover transaction"
                    );
                }
            }
        }

        Ok(Self {
            inner: Arc::new(FactoryInner {
                dir,
                _lock: lock,
                pool_size,
                next_id: AtomicU32::new(0),
                pool: Mutex::new(PoolState {
                    idle: Vec::new(),
                    open: 0,
                }),
                returned: Condvar::new(),
                leftovers: Mutex::new(leftovers),
            }),
        })
    }

    /// Directory holding the journal files.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Maximum number of journals leased at once.
    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Number of unfinished journals waiting for [`recover`](Self::recover).
    pub fn pending_recovery(&self) -> usize {
        self.inner.leftovers.lock().len()
    }

    /// Rolls back every unfinished journal against `storage`, newest first,
    /// and deletes the replayed files. Returns how many journals were replayed.
    pub fn recover(&self, storage: &dyn PersistentStorage) -> Result<usize> {
        let mut leftovers = self.inner.leftovers.lock();
        let mut replayed = 0;
        while let Some(mut journal) = leftovers.pop() {
            if let Err(err) = journal.replay_rollback(storage) {
                leftovers.push(journal);
                return Err(err);
            }
            let path = journal.path().to_path_buf();
            drop(journal);
            fs::remove_file(&path)?;
            replayed += 1;
        }
        Ok(replayed)
    }

    fn create_file(&self) -> Result<(StdFileIo, PathBuf)> {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let path = self.inner.dir.join(format!("{FILE_PREFIX}{id:03}"));
            if path.exists() {
                continue;
            }
            match StdFileIo::open_with(&path, OpenMode::CreateNew) {
                Ok(io) => return Ok((io, path)),
                Err(TreeError::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    continue
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Leases a fresh journal, waiting while every pooled file is in use.
    pub fn lease(&self) -> Result<JournalLease> {
        let (io, path) = {
            let mut pool = self.inner.pool.lock();
            loop {
                if let Some(file) = pool.idle.pop() {
                    break file;
                }
                if pool.open < self.inner.pool_size {
                    pool.open += 1;
                    drop(pool);
                    match self.create_file() {
                        Ok(file) => break file,
                        Err(err) => {
                            self.inner.pool.lock().open -= 1;
                            self.inner.returned.notify_one();
                            return Err(err);
                        }
                    }
                }
                self.inner.returned.wait(&mut pool);
            }
        };
        match Journal::begin(io.clone(), path.clone()) {
            Ok(journal) => Ok(JournalLease {
                journal: Some(journal),
                factory: Arc::clone(&self.inner),
            }),
            Err(err) => {
                self.inner.retire(io, path, false);
                Err(err)
            }
        }
    }
}

impl FactoryInner {
    fn retire(&self, io: StdFileIo, path: PathBuf, reusable: bool) {
        let mut pool = self.pool.lock();
        if reusable {
            pool.idle.push((io, path));
        } else {
            pool.open -= 1;
        }
        drop(pool);
        self.returned.notify_one();
    }
}

/// A journal borrowed from a [`JournalFactory`]; returned to the pool on drop.
///
/// A journal that still requires rollback when dropped is left on disk and
/// picked up by the next [`JournalFactory::open`].
pub struct JournalLease {
    journal: Option<Journal>,
    factory: Arc<FactoryInner>,
}

impl Deref for JournalLease {
    type Target = Journal;

    fn deref(&self) -> &Journal {
        self.journal
            .as_ref()
            .unwrap_or_else(|| unreachable!("journal taken before drop"))
    }
}

impl DerefMut for JournalLease {
    fn deref_mut(&mut self) -> &mut Journal {
        self.journal
            .as_mut()
            .unwrap_or_else(|| unreachable!("journal taken before drop"))
    }
}

impl Drop for JournalLease {
    fn drop(&mut self) {
        let Some(mut journal) = self.journal.take() else {
            return;
        };
        let path = journal.path().to_path_buf();
        if journal.rollback_required() {
            tracing::error!(
                target: "bpdict::journal",
                path = %path.display(),
                "journal released with unfinished work; leaving it for recovery"
            );
            let io = journal.io.clone();
            drop(journal);
            self.factory.retire(io, path, false);
            return;
        }
        let reusable = match journal.dispose() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    target: "bpdict::journal",
                    path = %path.display(),
                    error = %err,
                    "failed to dispose journal"
                );
                false
            }
        };
        let io = journal.io.clone();
        drop(journal);
        if !reusable {
            let _ = io.truncate(0);
        }
        self.factory.retire(io, path, reusable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::journal::{EntryKind, JournalState};
    use crate::storage::store::{FileStore, FileStoreOptions, NodeStorage};
    use crate::types::StorageHandle;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn pool_size_is_validated() -> Result<()> {
        let dir = tempdir().map_err(TreeError::Io)?;
        assert!(matches!(
            JournalFactory::open(dir.path().join("j"), 0),
            Err(TreeError::Configuration { .. })
        ));
        assert!(JournalFactory::open(dir.path().join("j"), 65).is_err());
        let factory = JournalFactory::open(dir.path().join("j"), 64)?;
        assert_eq!(factory.pool_size(), 64);
        Ok(())
    }

    #[test]
    fn directory_cannot_be_shared() -> Result<()> {
        let dir = tempdir().map_err(TreeError::Io)?;
        let first = JournalFactory::open(dir.path(), 2)?;
        assert!(JournalFactory::open(dir.path(), 2).is_err());
        drop(first);
        JournalFactory::open(dir.path(), 2)?;
        Ok(())
    }

    #[test]
    fn leases_are_reused_and_bounded() -> Result<()> {
        let dir = tempdir().map_err(TreeError::Io)?;
        let factory = JournalFactory::open(dir.path(), 1)?;
        let first = factory.lease()?;
        let first_path = first.path().to_path_buf();
        assert!(first_path.ends_with("transaction.001"));

        let contender = factory.clone();
        let waiter = thread::spawn(move || -> Result<PathBuf> {
            let lease = contender.lease()?;
            Ok(lease.path().to_path_buf())
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(first);
        let second_path = waiter.join().expect("waiter thread")?;
        assert_eq!(second_path, first_path);
        Ok(())
    }

    #[test]
    fn unfinished_journal_is_recovered_on_reopen() -> Result<()> {
        let dir = tempdir().map_err(TreeError::Io)?;
        let journal_dir = dir.path().join("journal");
        let store = FileStore::open(dir.path().join("data.bpd"), &FileStoreOptions::default())?;
        let node = store.create()?;
        store.write_node(node, b"committed")?;
        store.flush()?;

        {
            let factory = JournalFactory::open(&journal_dir, 4)?;
            let mut lease = factory.lease()?;
            lease.append(&store, EntryKind::Update, node, b"committed")?;
            store.write_node(node, b"half-done")?;
            let created = store.create()?;
            lease.append(&store, EntryKind::Create, created, &[])?;
            assert_eq!(lease.state(), JournalState::Pending);
        }

        let factory = JournalFactory::open(&journal_dir, 4)?;
        assert_eq!(factory.pending_recovery(), 1);
        assert_eq!(factory.recover(&store)?, 1);
        assert_eq!(factory.pending_recovery(), 0);
        assert_eq!(store.try_get_node(node)?, Some(b"committed".to_vec()));
        assert!(!journal_dir.join("transaction.001").exists());
        Ok(())
    }

    #[test]
    fn finished_and_empty_journals_are_removed() -> Result<()> {
        let dir = tempdir().map_err(TreeError::Io)?;
        {
            let factory = JournalFactory::open(dir.path(), 2)?;
            let store = FileStore::open(dir.path().join("s.bpd"), &FileStoreOptions::default())?;
            let mut lease = factory.lease()?;
            lease.append(&store, EntryKind::Delete, StorageHandle(2), &[])?;
            lease.begin_commit()?;
            lease.complete_commit()?;
        }
        fs::write(dir.path().join("transaction.007"), b"")?;
        fs::write(dir.path().join("transaction.008"), b"\x00\x00\x00\x09garbage-garbage-garbage")?;
        fs::write(dir.path().join("transaction.bak"), b"ignored")?;

        let factory = JournalFactory::open(dir.path(), 2)?;
        assert_eq!(factory.pending_recovery(), 0);
        assert!(!dir.path().join("transaction.001").exists());
        assert!(!dir.path().join("transaction.007").exists());
        assert!(dir.path().join("transaction.008.corrupt000").exists());
        assert!(dir.path().join("transaction.bak").exists());
        Ok(())
    }
}
