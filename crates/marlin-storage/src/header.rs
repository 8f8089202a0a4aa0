//! Header page: the persistent index-name to root-page-id record table.
//!
//! Resides at page id 0. Layout: `record_count: i32` at offset 0, then
//! fixed 36-byte records (name, NUL-padded to 32 bytes, followed by the
//! root page id).

use marlin_buffer::{BufferPoolManager, PageHandle};
use marlin_common::page::{PageId, PAGE_SIZE};
use marlin_common::{MarlinError, Result};

/// Maximum index name length in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// On-disk record size: name (32) + root page id (4).
const RECORD_SIZE: usize = MAX_NAME_LEN + 4;

/// Offset of the first record, after the count field.
const RECORDS_OFFSET: usize = 4;

/// Maximum number of records the header page holds.
pub const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// A pinned view over the header page.
///
/// Holds the pin for its lifetime; use it as a short-lived handle around
/// each record operation.
pub struct HeaderPage<'a> {
    page: PageHandle<'a>,
}

impl<'a> HeaderPage<'a> {
    /// Pins the header page, creating it when the data file is brand new.
    pub fn fetch(pool: &'a BufferPoolManager) -> Result<Self> {
        if pool.disk().num_pages() == 0 {
            let page = pool.new_page()?;
            debug_assert_eq!(page.page_id(), PageId::HEADER);
            // A zeroed page already encodes a record count of 0; persist it
            page.mark_dirty();
            return Ok(Self { page });
        }
        let page = pool.fetch_page(PageId::HEADER)?;
        Ok(Self { page })
    }

    /// Returns the number of records.
    pub fn record_count(&self) -> usize {
        let data = self.page.data();
        i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize
    }

    fn set_record_count(&self, count: usize) {
        let mut data = self.page.data_mut();
        data[0..4].copy_from_slice(&(count as i32).to_le_bytes());
    }

    fn record_offset(index: usize) -> usize {
        RECORDS_OFFSET + index * RECORD_SIZE
    }

    /// Encodes `name` as a NUL-padded fixed-width field.
    fn encode_name(name: &str) -> Result<[u8; MAX_NAME_LEN]> {
        let bytes = name.as_bytes();
        if bytes.len() > MAX_NAME_LEN {
            return Err(MarlinError::IndexNameTooLong {
                len: bytes.len(),
                max: MAX_NAME_LEN,
            });
        }
        let mut field = [0u8; MAX_NAME_LEN];
        field[..bytes.len()].copy_from_slice(bytes);
        Ok(field)
    }

    /// Returns the record index for `name`, if present.
    fn find_record(&self, name: &[u8; MAX_NAME_LEN]) -> Option<usize> {
        let count = self.record_count();
        let data = self.page.data();
        (0..count).find(|&i| {
            let off = Self::record_offset(i);
            &data[off..off + MAX_NAME_LEN] == name
        })
    }

    /// Looks up the root page id recorded for `name`.
    pub fn get_root_id(&self, name: &str) -> Result<Option<PageId>> {
        let field = Self::encode_name(name)?;
        let Some(index) = self.find_record(&field) else {
            return Ok(None);
        };
        let data = self.page.data();
        let off = Self::record_offset(index) + MAX_NAME_LEN;
        let root = i32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
        Ok(Some(PageId(root)))
    }

    /// Inserts a new record. Returns false when the name already exists.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> Result<bool> {
        let field = Self::encode_name(name)?;
        if self.find_record(&field).is_some() {
            return Ok(false);
        }

        let count = self.record_count();
        if count >= MAX_RECORDS {
            return Err(MarlinError::HeaderPageFull {
                capacity: MAX_RECORDS,
            });
        }

        {
            let mut data = self.page.data_mut();
            let off = Self::record_offset(count);
            data[off..off + MAX_NAME_LEN].copy_from_slice(&field);
            data[off + MAX_NAME_LEN..off + RECORD_SIZE]
                .copy_from_slice(&root_page_id.0.to_le_bytes());
        }
        self.set_record_count(count + 1);
        self.page.mark_dirty();
        Ok(true)
    }

    /// Updates the root page id of an existing record. Returns false when
    /// the name is not recorded.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> Result<bool> {
        let field = Self::encode_name(name)?;
        let Some(index) = self.find_record(&field) else {
            return Ok(false);
        };

        {
            let mut data = self.page.data_mut();
            let off = Self::record_offset(index) + MAX_NAME_LEN;
            data[off..off + 4].copy_from_slice(&root_page_id.0.to_le_bytes());
        }
        self.page.mark_dirty();
        Ok(true)
    }

    /// Deletes a record, keeping the remaining records contiguous.
    /// Returns false when the name is not recorded.
    pub fn delete_record(&mut self, name: &str) -> Result<bool> {
        let field = Self::encode_name(name)?;
        let Some(index) = self.find_record(&field) else {
            return Ok(false);
        };

        let count = self.record_count();
        {
            let mut data = self.page.data_mut();
            let hole = Self::record_offset(index);
            let tail_start = Self::record_offset(index + 1);
            let tail_end = Self::record_offset(count);
            data.copy_within(tail_start..tail_end, hole);
        }
        self.set_record_count(count - 1);
        self.page.mark_dirty();
        Ok(true)
    }
}
