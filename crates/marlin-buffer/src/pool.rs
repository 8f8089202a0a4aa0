//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId};
use crate::page_table::ExtendibleHashTable;
use crate::replacer::{LruReplacer, Replacer};
use log::debug;
use marlin_common::page::{PageId, PAGE_SIZE};
use marlin_common::{MarlinError, Result};
use marlin_disk::{DiskManager, LogManager};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
    /// Item capacity of each page-table bucket.
    pub bucket_capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            num_frames: 1024,
            bucket_capacity: 32,
        }
    }
}

/// Buffer pool manager.
///
/// Mediates all access to the paged data file through a fixed pool of
/// frames:
/// - Page id to frame id mapping via an extendible hash table
/// - Free frame list for pages entering the pool
/// - LRU replacement for eviction
/// - Pin counting so resident pages in use are never evicted
///
/// A single coarse latch serializes the compound entry points; it is held
/// across disk I/O, which is where operations may suspend.
pub struct BufferPoolManager {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page id to frame id mapping.
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// Frames not holding any page.
    free_list: Mutex<VecDeque<FrameId>>,
    /// Eviction candidates, least recently used first.
    replacer: LruReplacer<FrameId>,
    /// Backing storage.
    disk: Arc<DiskManager>,
    /// Optional write-ahead log; flushed before dirty write-back.
    log: Option<Arc<LogManager>>,
    /// Coarse latch serializing the entry points.
    latch: Mutex<()>,
}

impl BufferPoolManager {
    /// Creates a new buffer pool over the given disk manager.
    pub fn new(
        config: BufferPoolConfig,
        disk: Arc<DiskManager>,
        log: Option<Arc<LogManager>>,
    ) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();

        // All frames start in the free list
        let free_list: VecDeque<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        Self {
            page_table: ExtendibleHashTable::new(config.bucket_capacity),
            config,
            frames,
            free_list: Mutex::new(free_list),
            replacer: LruReplacer::new(),
            disk,
            log,
            latch: Mutex::new(()),
        }
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the backing disk manager.
    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Checks if a page is resident in the pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.find(&page_id).is_some()
    }

    #[inline]
    fn frame(&self, frame_id: FrameId) -> &BufferFrame {
        &self.frames[frame_id.0 as usize]
    }

    /// Picks a frame for an incoming page: free list first, then the LRU
    /// victim. Writes back a dirty victim (flushing the log first when one
    /// is attached) and purges its page-table entry.
    fn take_victim(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.victim().ok_or(MarlinError::BufferPoolFull)?;
        let frame = self.frame(frame_id);
        debug_assert_eq!(frame.pin_count(), 0, "victim frame must be unpinned");

        if let Some(old_id) = frame.page_id() {
            if frame.is_dirty() {
                if let Some(log) = &self.log {
                    log.flush()?;
                }
                let data = frame.read_data();
                self.disk.write_page(old_id, &data)?;
                frame.set_dirty(false);
            }
            self.page_table.remove(&old_id);
            debug!("evicted {} from {}", old_id, frame_id);
        }
        frame.set_page_id(None);

        Ok(frame_id)
    }

    /// Returns the frame to the free list after a failed install.
    fn release_frame(&self, frame_id: FrameId) {
        self.frame(frame_id).reset();
        self.free_list.lock().push_back(frame_id);
    }

    /// Fetches a page, pinning it for the lifetime of the returned handle.
    ///
    /// A resident page is pinned directly; otherwise a victim frame is
    /// claimed and the page is read from disk. Fails with
    /// `MarlinError::BufferPoolFull` when every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageHandle<'_>> {
        if !page_id.is_valid() {
            return Err(MarlinError::InvalidPageId(page_id.0));
        }

        let _latch = self.latch.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = self.frame(frame_id);
            if frame.pin() == 0 {
                // Was evictable; pinned frames never sit in the replacer
                self.replacer.erase(frame_id);
            }
            return Ok(PageHandle::new(self, frame, page_id));
        }

        let frame_id = self.take_victim()?;
        let frame = self.frame(frame_id);

        {
            let mut data = frame.write_data();
            if let Err(e) = self.disk.read_page(page_id, &mut **data) {
                drop(data);
                self.release_frame(frame_id);
                return Err(e);
            }
        }

        frame.set_page_id(Some(page_id));
        frame.set_dirty(false);
        frame.pin();
        self.page_table.insert(page_id, frame_id);

        Ok(PageHandle::new(self, frame, page_id))
    }

    /// Allocates a fresh page on disk and installs it, pinned and zeroed.
    pub fn new_page(&self) -> Result<PageHandle<'_>> {
        let _latch = self.latch.lock();

        let frame_id = self.take_victim()?;
        let page_id = match self.disk.allocate_page() {
            Ok(id) => id,
            Err(e) => {
                self.release_frame(frame_id);
                return Err(e);
            }
        };

        let frame = self.frame(frame_id);
        frame.write_data().fill(0);
        frame.set_page_id(Some(page_id));
        frame.set_dirty(false);
        frame.pin();
        self.page_table.insert(page_id, frame_id);

        Ok(PageHandle::new(self, frame, page_id))
    }

    /// Releases one pin on a page, ORing in the caller's dirty flag.
    ///
    /// Returns false when the page is not resident or its pin count is
    /// already zero. A pin count reaching zero makes the frame evictable.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _latch = self.latch.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };
        let frame = self.frame(frame_id);
        if frame.pin_count() == 0 {
            return false;
        }

        if is_dirty {
            // Once dirty, the frame stays dirty until written back
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            self.replacer.insert(frame_id);
        }
        true
    }

    /// Writes a resident page to disk unconditionally.
    ///
    /// Returns Ok(false) when the page is not resident. Clears the dirty
    /// flag after a successful write.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if !page_id.is_valid() {
            return Err(MarlinError::InvalidPageId(page_id.0));
        }

        let _latch = self.latch.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(false);
        };
        let frame = self.frame(frame_id);
        {
            let data = frame.read_data();
            self.disk.write_page(page_id, &data)?;
        }
        frame.set_dirty(false);
        Ok(true)
    }

    /// Writes every dirty resident page to disk. Returns the number of
    /// pages written.
    pub fn flush_all(&self) -> Result<usize> {
        let _latch = self.latch.lock();

        let mut flushed = 0;
        for frame in &self.frames {
            if let Some(page_id) = frame.page_id() {
                if frame.is_dirty() {
                    let data = frame.read_data();
                    self.disk.write_page(page_id, &data)?;
                    drop(data);
                    frame.set_dirty(false);
                    flushed += 1;
                }
            }
        }
        Ok(flushed)
    }

    /// Deletes a page from the pool and deallocates it on disk.
    ///
    /// Returns Ok(false) when the page is resident and pinned; the caller
    /// must unpin it first.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        if !page_id.is_valid() {
            return Err(MarlinError::InvalidPageId(page_id.0));
        }

        let _latch = self.latch.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = self.frame(frame_id);
            if frame.is_pinned() {
                return Ok(false);
            }

            self.page_table.remove(&page_id);
            self.replacer.erase(frame_id);
            frame.reset();
            self.free_list.lock().push_back(frame_id);
        }

        self.disk.deallocate_page(page_id)?;
        Ok(true)
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> PoolStats {
        let mut used_frames = 0;
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;

        for frame in &self.frames {
            if frame.page_id().is_some() {
                used_frames += 1;
                if frame.is_pinned() {
                    pinned_frames += 1;
                }
                if frame.is_dirty() {
                    dirty_frames += 1;
                }
            }
        }

        PoolStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_count(),
            evictable_frames: self.replacer.len(),
            used_frames,
            pinned_frames,
            dirty_frames,
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames sitting in the replacer.
    pub evictable_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

/// RAII handle over a pinned page.
///
/// The handle accumulates a dirty bit; dropping it unpins the page exactly
/// once with that bit, on every exit path.
pub struct PageHandle<'a> {
    pool: &'a BufferPoolManager,
    frame: &'a BufferFrame,
    page_id: PageId,
    dirty: Cell<bool>,
}

impl<'a> PageHandle<'a> {
    fn new(pool: &'a BufferPoolManager, frame: &'a BufferFrame, page_id: PageId) -> Self {
        Self {
            pool,
            frame,
            page_id,
            dirty: Cell::new(false),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the current pin count of the backing frame.
    pub fn pin_count(&self) -> u32 {
        self.frame.pin_count()
    }

    /// Returns read access to the page bytes.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.read_data()
    }

    /// Returns write access to the page bytes.
    ///
    /// Call `mark_dirty` once the mutation is real; taking the guard alone
    /// does not dirty the page.
    pub fn data_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.write_data()
    }

    /// Records that this handle modified the page; the drop-time unpin
    /// will carry the dirty flag.
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.dirty.get());
    }
}
