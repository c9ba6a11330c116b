#![forbid(unsafe_code)]
//! Positioned file I/O and the per-page lock vector that sits on top of it.

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::{Result, StorageError};

/// Positioned (pread/pwrite-style) file access, abstracted so tests can
/// substitute an in-memory implementation.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes starting at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` starting at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes file data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current length of the file, in bytes.
    fn len(&self) -> Result<u64>;
    /// `true` when the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Grows or shrinks the file to exactly `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod platform {
    use super::*;
    use std::os::unix::fs::FileExt;

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at hit EOF"));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "write_at wrote zero"));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::os::windows::fs::FileExt;

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read hit EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// `FileIo` backed by a real OS file handle.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already-open `File`.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens (creating if necessary) a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    /// Opens an existing file read-only.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        platform::read_exact(&self.inner, off, dst)?;
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        platform::write_all(&self.inner, off, src)?;
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len)?;
        Ok(())
    }
}

/// A paged file plus one lock per page, satisfying the invariant that the
/// lock vector's length always equals the page count.
///
/// Single-page critical sections use [`FileHandle::lock_page`] (a spinning
/// `RwLock`); operations that touch several pages at once (e.g. a bulk
/// index build) use [`FileHandle::lock_pages_ordered`], which always
/// acquires locks in ascending page-index order to avoid deadlock.
pub struct FileHandle<F: FileIo = StdFileIo> {
    file: F,
    page_size: u32,
    locks: Mutex<Vec<Arc<RwLock<()>>>>,
}

impl<F: FileIo> FileHandle<F> {
    /// Wraps `file`, whose length must already be a multiple of `page_size`.
    pub fn new(file: F, page_size: u32) -> Result<Self> {
        let len = file.len()?;
        if len % page_size as u64 != 0 {
            return Err(StorageError::CorruptionError(format!(
                "file length {len} is not a multiple of page size {page_size}"
            )));
        }
        let page_count = (len / page_size as u64) as usize;
        let locks = (0..page_count).map(|_| Arc::new(RwLock::new(()))).collect();
        Ok(Self {
            file,
            page_size,
            locks: Mutex::new(locks),
        })
    }

    /// Configured page size.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Current page count, derived from the lock vector length (kept in
    /// lock-step with the file length by `grow_to`).
    pub fn page_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Extends the file (and lock vector) so it holds at least
    /// `page_count` pages, returning the index of the first newly added
    /// page if any were added.
    pub fn grow_to(&self, page_count: usize) -> Result<()> {
        let mut locks = self.locks.lock();
        if page_count <= locks.len() {
            return Ok(());
        }
        self.file
            .truncate(page_count as u64 * self.page_size as u64)?;
        locks.resize_with(page_count, || Arc::new(RwLock::new(())));
        trace!(page_count, "file_handle.grow_to");
        Ok(())
    }

    /// Returns the per-page lock for `page_index`, panicking if the index
    /// is out of bounds (callers must `grow_to` first).
    pub fn page_lock(&self, page_index: usize) -> Arc<RwLock<()>> {
        self.locks.lock()[page_index].clone()
    }

    /// Acquires read/write locks for a set of page indices in ascending
    /// order, returning write guards the caller holds for the duration of
    /// a multi-page operation.
    pub fn lock_pages_ordered(&self, mut indices: Vec<usize>) -> Vec<Arc<RwLock<()>>> {
        indices.sort_unstable();
        indices.dedup();
        indices.into_iter().map(|i| self.page_lock(i)).collect()
    }

    /// Reads one full page into `dst`, which must be exactly `page_size`
    /// bytes.
    pub fn read_page(&self, page_index: usize, dst: &mut [u8]) -> Result<()> {
        let lock = self.page_lock(page_index);
        let _guard = lock.read();
        self.file
            .read_at(page_index as u64 * self.page_size as u64, dst)
    }

    /// Writes one full page from `src`, which must be exactly `page_size`
    /// bytes.
    pub fn write_page(&self, page_index: usize, src: &[u8]) -> Result<()> {
        let lock = self.page_lock(page_index);
        let _guard = lock.write();
        self.file
            .write_at(page_index as u64 * self.page_size as u64, src)
    }

    /// Flushes the underlying file.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()
    }

    /// Borrows the underlying `FileIo` for callers that need raw access
    /// (e.g. the WAL, which is not page-structured).
    pub fn raw(&self) -> &F {
        &self.file
    }
}
