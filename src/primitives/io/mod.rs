#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use crate::types::Result;

/// Positioned file I/O used by archive segments.
///
/// Every call carries its own offset, so a handle can be shared between the
/// flusher and sync readers without a shared cursor.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;
    /// True when the file holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// [`FileIo`] over a shared `std::fs::File`.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
}

impl StdFileIo {
    /// Creates (or truncates) a file for writing a new segment.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Opens a closed segment for reading.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }
}

#[cfg(unix)]
impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.read_exact_at(dst, off)?)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.write_all_at(src, off)?)
    }

    fn sync_all(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

// Segments are written once and read whole, so seeking a shared cursor is
// acceptable where positioned I/O is unavailable.
#[cfg(not(unix))]
impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(off))?;
        Ok(file.read_exact(dst)?)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(off))?;
        Ok(file.write_all(src)?)
    }

    fn sync_all(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}
