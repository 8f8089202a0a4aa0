//! Disk manager for page-level file I/O.

use marlin_common::page::{PageId, PAGE_SIZE};
use marlin_common::{MarlinError, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Path to the data file.
    pub path: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./marlin.db"),
            fsync_enabled: true,
        }
    }
}

/// Manages reading and writing pages of a single data file.
///
/// Pages are fixed-size and addressed by `PageId`; page `id` lives at byte
/// offset `id * PAGE_SIZE`. Allocation extends the file with a zeroed page,
/// or reuses a previously deallocated id.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// File handle and allocation state.
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    /// The data file.
    file: File,
    /// Number of pages in the file.
    num_pages: i32,
    /// Deallocated page ids available for reuse. In-memory only.
    free_pages: BTreeSet<PageId>,
}

impl DiskManager {
    /// Creates a new disk manager, opening or creating the data file.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as i32;

        Ok(Self {
            config,
            inner: Mutex::new(DiskInner {
                file,
                num_pages,
                free_pages: BTreeSet::new(),
            }),
        })
    }

    /// Returns the data file path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Returns the number of pages in the data file.
    pub fn num_pages(&self) -> i32 {
        self.inner.lock().num_pages
    }

    /// Reads a page into the provided buffer.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        if !page_id.is_valid() {
            return Err(MarlinError::InvalidPageId(page_id.0));
        }

        let mut inner = self.inner.lock();
        if page_id.0 >= inner.num_pages {
            return Err(MarlinError::InvalidPageId(page_id.0));
        }

        inner.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        inner.file.read_exact(buf)?;
        Ok(())
    }

    /// Writes a page to disk.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        if !page_id.is_valid() {
            return Err(MarlinError::InvalidPageId(page_id.0));
        }

        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        inner.file.write_all(data)?;

        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        // Track file growth if the write extended it
        if page_id.0 >= inner.num_pages {
            inner.num_pages = page_id.0 + 1;
        }

        Ok(())
    }

    /// Allocates a page id.
    ///
    /// Reuses a previously deallocated id when one exists (rewriting the
    /// on-disk page with zeroes), otherwise extends the file by one zeroed
    /// page.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();

        let page_id = match inner.free_pages.pop_first() {
            Some(reused) => reused,
            None => {
                let id = PageId::new(inner.num_pages);
                inner.num_pages += 1;
                id
            }
        };

        inner.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        inner.file.write_all(&[0u8; PAGE_SIZE])?;
        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        Ok(page_id)
    }

    /// Returns a page id to the allocator for reuse.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        if !page_id.is_valid() {
            return Err(MarlinError::InvalidPageId(page_id.0));
        }
        self.inner.lock().free_pages.insert(page_id);
        Ok(())
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.inner.lock().file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            path: dir.path().join("test.db"),
            fsync_enabled: false,
        };
        let dm = DiskManager::new(config).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_manager_new() {
        let (dm, _dir) = create_test_disk_manager();
        assert_eq!(dm.num_pages(), 0);
        assert!(dm.path().exists());
    }

    #[test]
    fn test_disk_manager_allocate_page() {
        let (dm, _dir) = create_test_disk_manager();

        let page1 = dm.allocate_page().unwrap();
        assert_eq!(page1, PageId::new(0));

        let page2 = dm.allocate_page().unwrap();
        assert_eq!(page2, PageId::new(1));

        assert_eq!(dm.num_pages(), 2);
    }

    #[test]
    fn test_disk_manager_write_read() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[100] = 0xCD;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(page_id, &data).unwrap();

        let mut read_data = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_data).unwrap();
        assert_eq!(read_data[0], 0xAB);
        assert_eq!(read_data[100], 0xCD);
        assert_eq!(read_data[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_disk_manager_allocated_page_reads_zeroed() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();
        let mut buf = [0xFFu8; PAGE_SIZE];
        dm.read_page(page_id, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_manager_read_invalid_page() {
        let (dm, _dir) = create_test_disk_manager();

        dm.allocate_page().unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        assert!(dm.read_page(PageId::new(99), &mut buf).is_err());
        assert!(dm.read_page(PageId::INVALID, &mut buf).is_err());
    }

    #[test]
    fn test_disk_manager_deallocate_and_reuse() {
        let (dm, _dir) = create_test_disk_manager();

        let p0 = dm.allocate_page().unwrap();
        let p1 = dm.allocate_page().unwrap();

        // Fill p0 with data, then deallocate it
        dm.write_page(p0, &[0xAA; PAGE_SIZE]).unwrap();
        dm.deallocate_page(p0).unwrap();

        // Allocation reuses the freed id and zeroes it on disk
        let reused = dm.allocate_page().unwrap();
        assert_eq!(reused, p0);

        let mut buf = [0xFFu8; PAGE_SIZE];
        dm.read_page(reused, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        // The file did not grow
        assert_eq!(dm.num_pages(), 2);
        let _ = p1;
    }

    #[test]
    fn test_disk_manager_overwrite_page() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();

        dm.write_page(page_id, &[0xAA; PAGE_SIZE]).unwrap();
        dm.write_page(page_id, &[0xBB; PAGE_SIZE]).unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut buf).unwrap();
        assert_eq!(buf[0], 0xBB);
    }

    #[test]
    fn test_disk_manager_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let page_id;

        {
            let dm = DiskManager::new(DiskManagerConfig {
                path: path.clone(),
                fsync_enabled: true,
            })
            .unwrap();
            page_id = dm.allocate_page().unwrap();

            let mut data = [0u8; PAGE_SIZE];
            data[0] = 0xFF;
            dm.write_page(page_id, &data).unwrap();
        }

        {
            let dm = DiskManager::new(DiskManagerConfig {
                path,
                fsync_enabled: true,
            })
            .unwrap();
            assert_eq!(dm.num_pages(), 1);

            let mut buf = [0u8; PAGE_SIZE];
            dm.read_page(page_id, &mut buf).unwrap();
            assert_eq!(buf[0], 0xFF);
        }
    }

    #[test]
    fn test_disk_manager_flush() {
        let (dm, _dir) = create_test_disk_manager();
        dm.allocate_page().unwrap();
        dm.flush().unwrap();
    }
}
