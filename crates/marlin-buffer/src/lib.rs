//! Buffer pool management for MarlinDB.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with configurable frame count
//! - LRU eviction policy for cache management
//! - Extendible hashing for the page table
//! - Pin counting and dirty tracking with RAII page handles

mod frame;
mod page_table;
mod pool;
mod replacer;

pub use frame::{BufferFrame, FrameId};
pub use page_table::ExtendibleHashTable;
pub use pool::{BufferPoolConfig, BufferPoolManager, PageHandle, PoolStats};
pub use replacer::{LruReplacer, Replacer};
