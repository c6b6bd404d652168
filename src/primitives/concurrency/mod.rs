#![allow(unsafe_code)]

//! Lock strategies for the tree and its nodes, plus the OS-level directory
//! lock that gives one process ownership of a journal directory.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock,
};
use serde::{Deserialize, Serialize};

use crate::types::{Result, TreeError};

/// Shared lock object handed out per node or per tree.
pub type LockCell = Arc<RwLock<()>>;

/// Intent of a lock request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockIntent {
    /// Query access.
    Read,
    /// Insert, update or delete access.
    Write,
}

/// Policy mapping a [`LockIntent`] onto an actual lock acquisition.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    /// Never lock. Callers accept dirty reads and racing writers.
    Ignore,
    /// Writers take the lock exclusively; readers never block.
    #[default]
    WriterOnly,
    /// Readers share the lock; writers take it exclusively.
    ReadWrite,
    /// Every access takes the lock exclusively.
    Exclusive,
}

/// Guard returned by [`LockStrategy::acquire`]; the lock is released on drop.
pub enum LockGuard {
    /// No lock was taken.
    Unlocked,
    /// Shared access.
    Shared(ArcRwLockReadGuard<RawRwLock, ()>),
    /// Exclusive access.
    Exclusive(ArcRwLockWriteGuard<RawRwLock, ()>),
}

impl LockGuard {
    /// Returns true when this guard excludes every other holder.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockGuard::Exclusive(_))
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            LockGuard::Unlocked => "unlocked",
            LockGuard::Shared(_) => "shared",
            LockGuard::Exclusive(_) => "exclusive",
        };
        f.write_str(kind)
    }
}

impl LockStrategy {
    /// Acquires `lock` for `intent`, waiting at most `timeout` (forever when `None`).
    ///
    /// `name` identifies the lock in the timeout error.
    pub fn acquire(
        self,
        lock: &LockCell,
        intent: LockIntent,
        timeout: Option<Duration>,
        name: &'static str,
    ) -> Result<LockGuard> {
        let exclusive = match (self, intent) {
            (LockStrategy::Ignore, _) => return Ok(LockGuard::Unlocked),
            (LockStrategy::WriterOnly, LockIntent::Read) => return Ok(LockGuard::Unlocked),
            (LockStrategy::ReadWrite, LockIntent::Read) => false,
            _ => true,
        };
        let guard = match (exclusive, timeout) {
            (false, None) => Some(LockGuard::Shared(lock.read_arc())),
            (false, Some(limit)) => lock.try_read_arc_for(limit).map(LockGuard::Shared),
            (true, None) => Some(LockGuard::Exclusive(lock.write_arc())),
            (true, Some(limit)) => lock.try_write_arc_for(limit).map(LockGuard::Exclusive),
        };
        guard.ok_or(TreeError::LockTimeout(name))
    }
}

/// Converts a millisecond lock timeout into a wait limit; `-1` waits forever.
pub fn timeout_from_ms(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}

/// Exclusive claim on a directory, held through an OS lock on its `locked` file.
///
/// The claim is also recorded in a process-wide registry because POSIX record
/// locks do not exclude other handles owned by the same process.
pub struct DirectoryLock {
    file: File,
    path: PathBuf,
}

fn claimed_directories() -> &'static Mutex<HashSet<PathBuf>> {
    static CLAIMED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    CLAIMED.get_or_init(|| Mutex::new(HashSet::new()))
}

impl DirectoryLock {
    /// Name of the lock file created inside the claimed directory.
    pub const LOCK_FILE: &'static str = "locked";

    /// Claims `dir`, failing immediately when another owner holds it.
    pub fn acquire(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let canonical = dir.canonicalize().map_err(TreeError::from)?;
        {
            let mut claimed = claimed_directories().lock();
            if !claimed.insert(canonical.clone()) {
                return Err(TreeError::Invalid("directory already claimed"));
            }
        }
        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(canonical.join(Self::LOCK_FILE))
            .map_err(TreeError::from)
            .and_then(|file| {
                if file.metadata()?.len() < 1 {
                    file.set_len(1)?;
                }
                if os::try_lock(&file)? {
                    Ok(file)
                } else {
                    Err(TreeError::Invalid("directory locked by another process"))
                }
            });
        match opened {
            Ok(file) => Ok(Self {
                file,
                path: canonical,
            }),
            Err(err) => {
                claimed_directories().lock().remove(&canonical);
                Err(err)
            }
        }
    }

    /// Directory this lock claims.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Err(err) = os::unlock(&self.file) {
            tracing::warn!(
                target: "bpdict::journal",
                path = %self.path.display(),
                error = %err,
                "failed to release directory lock"
            );
        }
        claimed_directories().lock().remove(&self.path);
    }
}

#[cfg(unix)]
mod os {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    fn first_byte(kind: libc::c_short) -> libc::flock {
        libc::flock {
            l_type: kind,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: 0,
            l_len: 1,
            l_pid: 0,
        }
    }

    /// Places a non-blocking write lock on byte 0. `Ok(false)` means another process holds it.
    pub fn try_lock(file: &File) -> io::Result<bool> {
        let mut region = first_byte(libc::F_WRLCK as libc::c_short);
        // SAFETY: the descriptor is owned by `file` and `region` outlives the call.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut region) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EACCES) => Ok(false),
            _ => Err(err),
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let mut region = first_byte(libc::F_UNLCK as libc::c_short);
        // SAFETY: as in `try_lock`.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut region) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod os {
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    /// Places a non-blocking exclusive lock on byte 0. `Ok(false)` means another process holds it.
    pub fn try_lock(file: &File) -> io::Result<bool> {
        // SAFETY: OVERLAPPED is plain data; zero means offset 0.
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
        // SAFETY: the handle is owned by `file` and `overlapped` outlives the call.
        let ok = unsafe {
            LockFileEx(file.as_raw_handle() as isize, flags, 0, 1, 0, &mut overlapped)
        };
        if ok != 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        // SAFETY: as in `try_lock`.
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        // SAFETY: as in `try_lock`.
        let ok = unsafe { UnlockFileEx(file.as_raw_handle() as isize, 0, 1, 0, &mut overlapped) };
        if ok != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod os {
    use std::fs::File;
    use std::io;

    pub fn try_lock(_file: &File) -> io::Result<bool> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "file locking unsupported"))
    }

    pub fn unlock(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn writer_only_never_blocks_readers() -> Result<()> {
        let lock: LockCell = Arc::new(RwLock::new(()));
        let strategy = LockStrategy::WriterOnly;
        let writer = strategy.acquire(&lock, LockIntent::Write, None, "node")?;
        assert!(writer.is_exclusive());
        let reader = strategy.acquire(&lock, LockIntent::Read, Some(Duration::ZERO), "node")?;
        assert!(matches!(reader, LockGuard::Unlocked));
        let err = strategy
            .acquire(&lock, LockIntent::Write, Some(Duration::from_millis(10)), "node")
            .unwrap_err();
        assert!(matches!(err, TreeError::LockTimeout("node")));
        Ok(())
    }

    #[test]
    fn read_write_shares_readers() -> Result<()> {
        let lock: LockCell = Arc::new(RwLock::new(()));
        let strategy = LockStrategy::ReadWrite;
        let first = strategy.acquire(&lock, LockIntent::Read, None, "tree")?;
        let second = strategy.acquire(&lock, LockIntent::Read, Some(Duration::ZERO), "tree")?;
        assert!(matches!(first, LockGuard::Shared(_)));
        assert!(matches!(second, LockGuard::Shared(_)));
        assert!(strategy
            .acquire(&lock, LockIntent::Write, Some(Duration::from_millis(5)), "tree")
            .is_err());
        drop((first, second));
        let writer = strategy.acquire(&lock, LockIntent::Write, Some(Duration::ZERO), "tree")?;
        assert!(writer.is_exclusive());
        Ok(())
    }

    #[test]
    fn exclusive_serializes_readers_across_threads() -> Result<()> {
        let lock: LockCell = Arc::new(RwLock::new(()));
        let held = LockStrategy::Exclusive.acquire(&lock, LockIntent::Read, None, "node")?;
        let contender = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            LockStrategy::Exclusive
                .acquire(
                    &contender,
                    LockIntent::Read,
                    Some(Duration::from_millis(20)),
                    "node",
                )
                .is_err()
        });
        assert!(handle.join().expect("thread"));
        drop(held);
        assert!(LockStrategy::Ignore
            .acquire(&lock, LockIntent::Write, Some(Duration::ZERO), "node")
            .is_ok());
        Ok(())
    }

    #[test]
    fn timeout_conversion() {
        assert_eq!(timeout_from_ms(-1), None);
        assert_eq!(timeout_from_ms(0), Some(Duration::ZERO));
        assert_eq!(timeout_from_ms(1500), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn directory_lock_is_exclusive() -> Result<()> {
        let dir = tempdir().map_err(TreeError::Io)?;
        let first = DirectoryLock::acquire(dir.path())?;
        assert!(first.path().join(DirectoryLock::LOCK_FILE).exists());
        assert!(DirectoryLock::acquire(dir.path()).is_err());
        drop(first);
        let again = DirectoryLock::acquire(dir.path())?;
        drop(again);
        Ok(())
    }
}
