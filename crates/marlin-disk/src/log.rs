//! Append-only operation log.
//!
//! The log manager assigns monotonically increasing LSNs and persists
//! framed records. The buffer pool flushes the log before writing back a
//! dirty page when a log manager is attached; replay is out of scope.

use bytes::{BufMut, BytesMut};
use marlin_common::Result;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Log sequence number: the byte offset of a record in the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// Configuration for the log manager.
#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    /// Path to the log file.
    pub path: PathBuf,
    /// Enable fsync on flush.
    pub fsync_enabled: bool,
}

impl Default for LogManagerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./marlin.log"),
            fsync_enabled: true,
        }
    }
}

/// Thread-safe append-only log writer.
///
/// Record framing: `[payload_len: u32][lsn: u64][payload]`.
pub struct LogManager {
    /// Configuration.
    config: LogManagerConfig,
    /// The log file, opened in append mode.
    file: Mutex<File>,
    /// LSN of the next record.
    next_lsn: AtomicU64,
    /// Highest LSN known durable.
    flushed_lsn: AtomicU64,
}

/// Frame overhead per record: payload_len (4) + lsn (8).
const FRAME_HEADER_LEN: usize = 12;

impl LogManager {
    /// Creates a new log manager, opening or creating the log file.
    pub fn new(config: LogManagerConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&config.path)?;

        let end = file.metadata()?.len();

        Ok(Self {
            config,
            file: Mutex::new(file),
            next_lsn: AtomicU64::new(end),
            flushed_lsn: AtomicU64::new(end),
        })
    }

    /// Returns the log file path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Returns the LSN the next record will receive.
    pub fn next_lsn(&self) -> Lsn {
        Lsn(self.next_lsn.load(Ordering::Acquire))
    }

    /// Returns the highest LSN known durable.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed_lsn.load(Ordering::Acquire))
    }

    /// Appends a record and returns its LSN.
    ///
    /// The record is buffered in the OS; call `flush` to make it durable.
    pub fn append(&self, payload: &[u8]) -> Result<Lsn> {
        let mut file = self.file.lock();

        let lsn = Lsn(self.next_lsn.load(Ordering::Acquire));

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.put_u32_le(payload.len() as u32);
        frame.put_u64_le(lsn.0);
        frame.put_slice(payload);
        file.write_all(&frame)?;

        self.next_lsn
            .store(lsn.0 + frame.len() as u64, Ordering::Release);
        Ok(lsn)
    }

    /// Makes all appended records durable.
    pub fn flush(&self) -> Result<()> {
        let file = self.file.lock();
        if self.config.fsync_enabled {
            file.sync_all()?;
        }
        self.flushed_lsn
            .store(self.next_lsn.load(Ordering::Acquire), Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_log_manager() -> (LogManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = LogManagerConfig {
            path: dir.path().join("test.log"),
            fsync_enabled: false,
        };
        let lm = LogManager::new(config).unwrap();
        (lm, dir)
    }

    #[test]
    fn test_log_manager_new() {
        let (lm, _dir) = create_test_log_manager();
        assert_eq!(lm.next_lsn(), Lsn(0));
        assert_eq!(lm.flushed_lsn(), Lsn(0));
    }

    #[test]
    fn test_log_manager_append_assigns_increasing_lsns() {
        let (lm, _dir) = create_test_log_manager();

        let lsn1 = lm.append(b"first").unwrap();
        let lsn2 = lm.append(b"second").unwrap();

        assert_eq!(lsn1, Lsn(0));
        assert!(lsn2 > lsn1);
        // lsn2 = frame header + payload of the first record
        assert_eq!(lsn2, Lsn((FRAME_HEADER_LEN + 5) as u64));
    }

    #[test]
    fn test_log_manager_flush_advances_flushed_lsn() {
        let (lm, _dir) = create_test_log_manager();

        lm.append(b"record").unwrap();
        assert_eq!(lm.flushed_lsn(), Lsn(0));

        lm.flush().unwrap();
        assert_eq!(lm.flushed_lsn(), lm.next_lsn());
    }

    #[test]
    fn test_log_manager_lsn_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen.log");

        let end = {
            let lm = LogManager::new(LogManagerConfig {
                path: path.clone(),
                fsync_enabled: true,
            })
            .unwrap();
            lm.append(b"payload").unwrap();
            lm.flush().unwrap();
            lm.next_lsn()
        };

        let lm = LogManager::new(LogManagerConfig {
            path,
            fsync_enabled: true,
        })
        .unwrap();
        assert_eq!(lm.next_lsn(), end);
    }
}
