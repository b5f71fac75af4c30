//! Persistent storage backend for idrecon.
//!
//! This module provides durable, crash-safe storage with:
//! - Write-Ahead Logging (WAL) of every committed transaction
//! - File locking for single-process ownership of a directory
//! - CRC32 checksums for corruption detection
//! - Snapshot compaction to bound replay time
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                PersistentContactStore                │
//! ├──────────────────────────────────────────────────────┤
//! │  ContactTable (RwLock)  ◄── replay ──┐               │
//! │        │ commit                      │               │
//! │        ↓                             │               │
//! │  ┌─────────────────┐   ┌─────────────────┐           │
//! │  │ WriteAheadLog   │   │ contacts.snap   │           │
//! │  │ (append-only)   │   │ (compacted)     │           │
//! │  └─────────────────┘   └─────────────────┘           │
//! │           FileLock (.lock, flock / LockFileEx)       │
//! └──────────────────────────────────────────────────────┘
//! ```

mod codec;
mod file_lock;
mod snapshot;
mod stores;
mod wal;

pub use file_lock::FileLock;
pub use stores::{CompactionResult, PersistentContactStore};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::storage::traits::StorageError;

/// Configuration for persistent storage.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// WAL size that triggers compaction in `maybe_compact` (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024, // 64 MB
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024; // 4 KiB minimum to avoid degenerate compaction loops

    /// Reject configurations that would compact on nearly every commit.
    pub fn validate(self) -> Result<Self, StorageError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(StorageError::BackendError(format!(
                "max_wal_size must be at least {} bytes (got {})",
                Self::MIN_WAL_SIZE,
                self.max_wal_size
            )));
        }
        Ok(self)
    }
}

/// Open or create a persistent contact database at the given path.
///
/// # Errors
/// - If the path cannot be created or accessed
/// - If another process holds the lock
/// - If snapshot loading or WAL replay detects corruption
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use idrecon::storage::open_database;
///
/// let store = Arc::new(open_database("./contacts.db", None)?);
/// let service = idrecon::IdentityService::new(store);
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentContactStore, StorageError> {
    let cfg = config.unwrap_or_default().validate()?;
    PersistentContactStore::open(path.as_ref(), cfg)
}
