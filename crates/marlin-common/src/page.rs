//! Page identifiers and sizing for MarlinDB storage.

use serde::{Deserialize, Serialize};

/// Size of a single page in bytes (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Identifier of a page within the data file.
///
/// Page ids are non-negative; `PageId::INVALID` (-1) is the sentinel for
/// "no page". Page id 0 is reserved for the header page.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PageId(pub i32);

impl PageId {
    /// Sentinel for "no page".
    pub const INVALID: PageId = PageId(-1);

    /// The header page holding the index-name to root-page-id records.
    pub const HEADER: PageId = PageId(0);

    /// Creates a new PageId.
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    /// Returns true if this is a valid (non-sentinel) page id.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }

    /// Byte offset of this page within the data file.
    #[inline]
    pub fn file_offset(&self) -> u64 {
        debug_assert!(self.is_valid());
        self.0 as u64 * PAGE_SIZE as u64
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page:{}", self.0)
    }
}
