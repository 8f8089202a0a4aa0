//! Record identifiers: the values stored in B+tree leaves.

use crate::page::PageId;
use serde::{Deserialize, Serialize};

/// Identifies a record by its page and slot number.
///
/// Rids are opaque to the storage core; the index stores and returns them
/// without interpreting the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    /// Page the record lives on.
    pub page_id: PageId,
    /// Slot within that page.
    pub slot: u32,
}

impl Rid {
    /// Encoded size on disk: page_id (4) + slot (4).
    pub const ENCODED_LEN: usize = 8;

    /// Creates a new Rid.
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }

    /// Serializes into `buf[..ENCODED_LEN]`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.page_id.0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.slot.to_le_bytes());
    }

    /// Deserializes from `buf[..ENCODED_LEN]`.
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            page_id: PageId(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            slot: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_id.0, self.slot)
    }
}
