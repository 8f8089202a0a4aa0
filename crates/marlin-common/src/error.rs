//! Error types for MarlinDB.

use thiserror::Error;

/// Result type alias using MarlinError.
pub type Result<T> = std::result::Result<T, MarlinError>;

/// Errors that can occur in MarlinDB operations.
#[derive(Debug, Error)]
pub enum MarlinError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Buffer pool errors
    #[error("Buffer pool full, no evictable frame")]
    BufferPoolFull,

    #[error("Invalid page id: {0}")]
    InvalidPageId(i32),

    // Header page errors
    #[error("Header page full: capacity {capacity} records")]
    HeaderPageFull { capacity: usize },

    #[error("Index name too long: {len} bytes (max {max})")]
    IndexNameTooLong { len: usize, max: usize },

    // B+ tree errors
    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
