//! The buffer manager: pins fixed-size pages into a bounded pool of frames,
//! evicting via clock-sweep when the pool is full, and mediates every read
//! or write of page-resident data through RAII guards so pin counts can
//! never leak.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::{Result, StorageError};
use crate::io::{FileHandle, FileIo};
use crate::pager::frame::{Frame, FrameState};
use crate::pager::shadow::ShadowFile;
use crate::types::PageId;

/// Governs how a page miss is satisfied.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadPolicy {
    /// Read the page from the backing file (the default).
    ReadFromFile,
    /// Skip the file read and hand back a zeroed frame — used when a
    /// caller is about to overwrite the entire page (e.g. a fresh
    /// allocation).
    AssumeInitialized,
    /// Consult the shadow file first; fall back to the backing file if the
    /// page has no shadow copy.
    ReadThroughShadow,
}

struct Inner<F: FileIo> {
    file: Arc<FileHandle<F>>,
    shadow: Option<Arc<ShadowFile<F>>>,
    frames: Vec<RwLock<Frame>>,
    page_table: Mutex<FxHashMap<PageId, usize>>,
    clock_hand: AtomicUsize,
    page_size: usize,
}

/// A bounded pool of page-sized frames backed by one data file and an
/// optional shadow overlay.
pub struct BufferManager<F: FileIo = crate::io::StdFileIo> {
    inner: Arc<Inner<F>>,
}

impl<F: FileIo> Clone for BufferManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: FileIo> BufferManager<F> {
    /// Creates a pool of `capacity` frames, each `page_size` bytes, over
    /// `file` with an optional shadow overlay.
    pub fn new(
        file: Arc<FileHandle<F>>,
        shadow: Option<Arc<ShadowFile<F>>>,
        capacity: usize,
        page_size: usize,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(StorageError::ConfigError(
                "buffer pool capacity must be nonzero".into(),
            ));
        }
        let frames = (0..capacity)
            .map(|_| RwLock::new(Frame::new(page_size)))
            .collect();
        Ok(Self {
            inner: Arc::new(Inner {
                file,
                shadow,
                frames,
                page_table: Mutex::new(FxHashMap::default()),
                clock_hand: AtomicUsize::new(0),
                page_size,
            }),
        })
    }

    /// Configured page size.
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Number of frames in the pool.
    pub fn capacity(&self) -> usize {
        self.inner.frames.len()
    }

    /// Grows the backing file so it holds at least `page_count` pages,
    /// without pinning or initializing any of them. Callers that need to
    /// reserve page-addressable space ahead of use (e.g. a bulk index
    /// build) call this before pinning pages in that range.
    pub fn ensure_file_capacity(&self, page_count: usize) -> Result<()> {
        self.inner.file.grow_to(page_count)
    }

    /// Pins `page_id` for shared (read) access, loading it from the
    /// backing file/shadow if it is not already resident.
    pub fn pin_read(&self, page_id: PageId, policy: ReadPolicy) -> Result<PageRef<'_, F>> {
        let frame_idx = self.acquire_frame(page_id, policy)?;
        let guard = self.inner.frames[frame_idx].read();
        Ok(PageRef {
            mgr: self,
            frame_idx,
            guard,
        })
    }

    /// Pins `page_id` for exclusive (write) access.
    pub fn pin_write(&self, page_id: PageId, policy: ReadPolicy) -> Result<PageMut<'_, F>> {
        let frame_idx = self.acquire_frame(page_id, policy)?;
        let guard = self.inner.frames[frame_idx].write();
        Ok(PageMut {
            mgr: self,
            frame_idx,
            guard,
        })
    }

    fn acquire_frame(&self, page_id: PageId, policy: ReadPolicy) -> Result<usize> {
        {
            let mut table = self.inner.page_table.lock();
            if let Some(&idx) = table.get(&page_id) {
                let mut frame = self.inner.frames[idx].write();
                frame.pin_count += 1;
                frame.state = FrameState::Hot;
                return Ok(idx);
            }
            let idx = self.find_victim(&mut table)?;
            {
                let mut frame = self.inner.frames[idx].write();
                if frame.dirty {
                    self.writeback_locked(&frame)?;
                }
                if let Some(old_id) = frame.page_id.take() {
                    table.remove(&old_id);
                }
                self.load_into(&mut frame, page_id, policy)?;
                frame.pin_count = 1;
                frame.state = FrameState::Hot;
            }
            table.insert(page_id, idx);
            Ok(idx)
        }
    }

    fn find_victim(&self, table: &mut FxHashMap<PageId, usize>) -> Result<usize> {
        let capacity = self.inner.frames.len();
        // Prefer a genuinely free frame before evicting anything.
        for idx in 0..capacity {
            let frame = self.inner.frames[idx].read();
            if frame.page_id.is_none() {
                return Ok(idx);
            }
        }
        let mut scanned = 0usize;
        loop {
            let idx = self.inner.clock_hand.fetch_add(1, Ordering::Relaxed) % capacity;
            let mut frame = self.inner.frames[idx].write();
            if frame.pin_count > 0 {
                scanned += 1;
                if scanned > capacity * 2 {
                    return Err(StorageError::BufferManagerError(
                        "no unpinned frame available for eviction".into(),
                    ));
                }
                continue;
            }
            match frame.state {
                FrameState::Hot => {
                    frame.state = FrameState::Cold;
                    scanned += 1;
                    if scanned > capacity * 2 {
                        return Err(StorageError::BufferManagerError(
                            "no unpinned frame available for eviction".into(),
                        ));
                    }
                    continue;
                }
                FrameState::Cold | FrameState::Free => {
                    if let Some(old_id) = frame.page_id {
                        table.remove(&old_id);
                        debug!(page_id = old_id.0, frame = idx, "buffer_manager.evict");
                    }
                    return Ok(idx);
                }
            }
        }
    }

    fn writeback_locked(&self, frame: &Frame) -> Result<()> {
        let page_id = frame
            .page_id
            .ok_or_else(|| StorageError::BufferManagerError("writeback of empty frame".into()))?;
        self.inner.file.write_page(page_id.0 as usize, &frame.data)?;
        Ok(())
    }

    fn load_into(&self, frame: &mut Frame, page_id: PageId, policy: ReadPolicy) -> Result<()> {
        frame.page_id = Some(page_id);
        frame.dirty = false;
        match policy {
            ReadPolicy::AssumeInitialized => {
                frame.data.iter_mut().for_each(|b| *b = 0);
            }
            ReadPolicy::ReadFromFile => {
                self.inner.file.read_page(page_id.0 as usize, &mut frame.data)?;
            }
            ReadPolicy::ReadThroughShadow => {
                let from_shadow = self
                    .inner
                    .shadow
                    .as_ref()
                    .map(|s| s.read_if_present(page_id, &mut frame.data))
                    .transpose()?
                    .unwrap_or(false);
                if !from_shadow {
                    self.inner.file.read_page(page_id.0 as usize, &mut frame.data)?;
                }
            }
        }
        trace!(page_id = page_id.0, ?policy, "buffer_manager.load");
        Ok(())
    }

    fn unpin(&self, frame_idx: usize) {
        // Hold the page-table lock while decrementing so a concurrent
        // `acquire_frame` eviction scan can't observe pin_count mid-update.
        let _table = self.inner.page_table.lock();
        let mut frame = self.inner.frames[frame_idx].write();
        debug_assert!(frame.pin_count > 0, "pin count underflow");
        frame.pin_count = frame.pin_count.saturating_sub(1);
    }

    /// Writes every dirty frame back to the file and clears their dirty
    /// bits; used by checkpoint.
    pub fn flush_all(&self) -> Result<()> {
        for frame_lock in &self.inner.frames {
            let mut frame = frame_lock.write();
            if frame.dirty {
                self.writeback_locked(&frame)?;
                frame.dirty = false;
            }
        }
        self.inner.file.sync()
    }

    /// Total pin count across all frames — used by tests asserting the
    /// "no leaked pins" invariant.
    pub fn total_pins(&self) -> u32 {
        self.inner
            .frames
            .iter()
            .map(|f| f.read().pin_count)
            .sum()
    }
}

/// RAII shared-read pin. Releases the pin automatically on drop.
pub struct PageRef<'a, F: FileIo> {
    mgr: &'a BufferManager<F>,
    frame_idx: usize,
    guard: RwLockReadGuard<'a, Frame>,
}

impl<'a, F: FileIo> PageRef<'a, F> {
    /// Borrows the page's raw bytes.
    pub fn data(&self) -> &[u8] {
        &self.guard.data
    }
}

impl<'a, F: FileIo> Drop for PageRef<'a, F> {
    fn drop(&mut self) {
        self.mgr.unpin(self.frame_idx);
    }
}

/// RAII exclusive-write pin. Marks the frame dirty on every mutable borrow
/// and releases the pin automatically on drop.
pub struct PageMut<'a, F: FileIo> {
    mgr: &'a BufferManager<F>,
    frame_idx: usize,
    guard: RwLockWriteGuard<'a, Frame>,
}

impl<'a, F: FileIo> PageMut<'a, F> {
    /// Borrows the page's raw bytes.
    pub fn data(&self) -> &[u8] {
        &self.guard.data
    }

    /// Mutably borrows the page's raw bytes and marks the frame dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.guard.dirty = true;
        &mut self.guard.data
    }
}

impl<'a, F: FileIo> Drop for PageMut<'a, F> {
    fn drop(&mut self) {
        self.mgr.unpin(self.frame_idx);
    }
}
