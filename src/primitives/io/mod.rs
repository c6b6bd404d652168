#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, IoSlice};
use std::path::Path;
use std::sync::Arc;

use crate::types::{Result, TreeError};

/// Positioned reads and writes on a shared file handle.
///
/// Every call names its own offset, so one handle can be used from several
/// threads without a shared cursor.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from `off`, failing on a short file.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Writes `bufs` back to back starting at `off`.
    fn writev_at(&self, off: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        let mut at = off;
        for buf in bufs.iter().filter(|buf| !buf.is_empty()) {
            self.write_at(at, buf)?;
            at = at
                .checked_add(buf.len() as u64)
                .ok_or(TreeError::Invalid("write offset overflow"))?;
        }
        Ok(())
    }
    /// Flushes data and metadata to the device.
    fn sync_all(&self) -> Result<()>;
    /// Current file length.
    fn len(&self) -> Result<u64>;
    /// Whether the file holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Shrinks or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// How [`StdFileIo::open_with`] treats the target path.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// The file must exist; opened read-write.
    Existing,
    /// Opened read-write, created when missing.
    CreateIfMissing,
    /// Created or emptied, then opened read-write.
    Truncate,
    /// Created; fails when the path already exists.
    CreateNew,
    /// The file must exist; opened without write access.
    ReadOnly,
}

impl OpenMode {
    fn options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(true).write(self != OpenMode::ReadOnly);
        match self {
            OpenMode::CreateIfMissing => opts.create(true).truncate(false),
            OpenMode::Truncate => opts.create(true).truncate(true),
            OpenMode::CreateNew => opts.create_new(true),
            OpenMode::Existing | OpenMode::ReadOnly => &mut opts,
        };
        opts
    }
}

#[cfg(unix)]
fn read_once(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, dst, off)
}

#[cfg(unix)]
fn write_once(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, src, off)
}

#[cfg(windows)]
fn read_once(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, dst, off)
}

#[cfg(windows)]
fn write_once(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, src, off)
}

#[cfg(not(any(unix, windows)))]
fn read_once(_file: &File, _dst: &mut [u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(ErrorKind::Unsupported, "positioned reads unsupported"))
}

#[cfg(not(any(unix, windows)))]
fn write_once(_file: &File, _src: &[u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(ErrorKind::Unsupported, "positioned writes unsupported"))
}

/// [`FileIo`] over a `std::fs::File`. Clones share the handle.
#[derive(Clone, Debug)]
pub struct StdFileIo {
    file: Arc<File>,
}

impl StdFileIo {
    /// Opens `path` according to `mode`.
    pub fn open_with(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let file = mode.options().open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < dst.len() {
            match read_once(&self.file, &mut dst[done..], off + done as u64) {
                Ok(0) => {
                    let err = io::Error::new(ErrorKind::UnexpectedEof, "read past end of file");
                    return Err(err.into());
                }
                Ok(n) => done += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < src.len() {
            match write_once(&self.file, &src[done..], off + done as u64) {
                Ok(0) => {
                    let err = io::Error::new(ErrorKind::WriteZero, "positioned write stalled");
                    return Err(err.into());
                }
                Ok(n) => done += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        Ok(self.file.set_len(len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn positioned_writes_round_trip() -> Result<()> {
        let dir = tempdir().map_err(TreeError::Io)?;
        let io = StdFileIo::open_with(dir.path().join("io.bin"), OpenMode::CreateIfMissing)?;
        io.write_at(4, b"tail")?;
        io.writev_at(0, &[IoSlice::new(b"he"), IoSlice::new(b""), IoSlice::new(b"ad")])?;
        let mut buf = [0u8; 8];
        io.read_at(0, &mut buf)?;
        assert_eq!(&buf, b"headtail");
        assert_eq!(io.len()?, 8);
        io.truncate(2)?;
        assert_eq!(io.len()?, 2);
        assert!(io.read_at(0, &mut buf).is_err());
        Ok(())
    }

    #[test]
    fn open_modes_respect_existence() -> Result<()> {
        let dir = tempdir().map_err(TreeError::Io)?;
        let path = dir.path().join("missing.bin");
        assert!(StdFileIo::open_with(&path, OpenMode::Existing).is_err());
        assert!(StdFileIo::open_with(&path, OpenMode::ReadOnly).is_err());
        StdFileIo::open_with(&path, OpenMode::CreateIfMissing)?.write_at(0, b"data")?;
        let ro = StdFileIo::open_with(&path, OpenMode::ReadOnly)?;
        assert!(ro.write_at(0, b"x").is_err());
        assert!(StdFileIo::open_with(&path, OpenMode::CreateNew).is_err());
        assert!(StdFileIo::open_with(&path, OpenMode::Truncate)?.is_empty()?);
        Ok(())
    }
}
