//! Persistent contact store.
//!
//! Wraps:
//! - An in-memory [`ContactTable`] for reads and matching
//! - WAL integration for durable commits
//! - A snapshot file for compacted history

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::contact::{Contact, ContactId};
use crate::storage::memory::lock_err;
use crate::storage::table::{CommitLog, ContactTable, TableTransaction};
use crate::storage::traits::{ContactStore, ContactTransaction, StorageError};

use super::file_lock::FileLock;
use super::snapshot::{self, SnapshotData};
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "contacts.wal";
const SNAPSHOT_FILE: &str = "contacts.snap";

fn storage_err(context: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::BackendError(format!("{context}: {e}"))
}

/// Durable contact store backed by a write-ahead log.
///
/// Transactions are serializable: each holds the table's write lock until it
/// commits or is dropped. A commit appends one WAL record before the table is
/// updated, so a failed append leaves both disk and memory untouched.
pub struct PersistentContactStore {
    dir: PathBuf,
    _lock: FileLock,
    wal: Arc<WriteAheadLog>,
    table: RwLock<ContactTable>,
    clock: Arc<dyn Clock>,
    config: PersistentConfig,
}

impl PersistentContactStore {
    /// Open or create a database directory.
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        Self::open_with_clock(dir, config, Arc::new(SystemClock))
    }

    /// Open or create a database directory with an explicit time source.
    pub fn open_with_clock(
        dir: &Path,
        config: PersistentConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)
            .map_err(|e| storage_err("failed to create database directory", e))?;

        let lock = FileLock::acquire(dir).map_err(|e| storage_err("failed to acquire lock", e))?;

        let wal = Arc::new(
            WriteAheadLog::open_with_clock(&dir.join(WAL_FILE), config.sync_on_write, Arc::clone(&clock))
                .map_err(|e| storage_err("failed to open WAL", e))?,
        );

        let store = Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            table: RwLock::new(ContactTable::default()),
            clock,
            config,
        };

        store.load_snapshot()?;
        store.replay_wal()?;
        Ok(store)
    }

    fn load_snapshot(&self) -> Result<(), StorageError> {
        let Some(data) = snapshot::read_snapshot(&self.dir.join(SNAPSHOT_FILE))
            .map_err(|e| storage_err("failed to load snapshot", e))?
        else {
            return Ok(());
        };

        let mut table = self.table.write().map_err(|_| lock_err("contacts.snapshot"))?;
        for contact in data.contacts {
            table.upsert(contact);
        }
        Ok(())
    }

    fn replay_wal(&self) -> Result<(), StorageError> {
        let iter = self
            .wal
            .iter()
            .map_err(|e| storage_err("failed to iterate WAL", e))?;

        let mut table = self.table.write().map_err(|_| lock_err("contacts.replay"))?;
        let mut count = 0usize;
        for entry_result in iter {
            let entry = entry_result.map_err(|e| storage_err("corrupted WAL entry", e))?;
            match entry.kind {
                WalEntryKind::Commit { rows } => {
                    for contact in rows {
                        table.upsert(contact);
                    }
                }
                WalEntryKind::Checkpoint { .. } => {}
            }
            count += 1;
        }

        if count > 0 {
            info!(entries = count, rows = table.len(), "replayed WAL");
        }
        Ok(())
    }

    /// Directory this store was opened from.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current WAL size in bytes.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        Ok(self.wal.size_bytes()?)
    }

    /// Fold the WAL into the snapshot file and truncate it.
    ///
    /// Holds the table's write lock throughout, so no transaction can commit
    /// between the snapshot and the truncation. A crash after the snapshot
    /// but before truncation replays rows the snapshot already holds, which
    /// upserts identical images.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let table = self.table.write().map_err(|_| lock_err("contacts.compact"))?;

        let entries_compacted = self.wal.current_sequence()?;
        let wal_size_before = self.wal.size_bytes()?;
        if entries_compacted == 0 {
            return Ok(CompactionResult {
                entries_compacted,
                rows: table.len(),
                wal_size_before,
                wal_size_after: wal_size_before,
            });
        }

        let data = SnapshotData {
            written_at: self.clock.now(),
            contacts: table.contacts().cloned().collect(),
        };
        snapshot::write_snapshot(&self.dir.join(SNAPSHOT_FILE), &data, self.config.sync_on_write)
            .map_err(|e| storage_err("failed to write snapshot", e))?;

        self.wal
            .append(WalEntryKind::Checkpoint {
                up_to_sequence: entries_compacted,
            })
            .map_err(|e| storage_err("failed to write checkpoint", e))?;
        self.wal
            .truncate()
            .map_err(|e| storage_err("failed to truncate WAL", e))?;

        let wal_size_after = self.wal.size_bytes()?;
        info!(entries = entries_compacted, rows = data.contacts.len(), "compacted WAL");

        Ok(CompactionResult {
            entries_compacted,
            rows: data.contacts.len(),
            wal_size_before,
            wal_size_after,
        })
    }

    /// Compact when the WAL has outgrown [`PersistentConfig::max_wal_size`].
    pub fn maybe_compact(&self) -> Result<Option<CompactionResult>, StorageError> {
        let size = self.wal_size()?;
        if size < self.config.max_wal_size {
            return Ok(None);
        }
        match self.compact() {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                warn!(error = %e, wal_size = size, "compaction failed");
                Err(e)
            }
        }
    }
}

impl ContactStore for PersistentContactStore {
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError> {
        let guard = self.table.write().map_err(|_| lock_err("contacts.begin"))?;
        let log: &dyn CommitLog = &*self.wal;
        Ok(Box::new(TableTransaction::new(guard, &*self.clock, Some(log))))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("contacts.get"))?;
        Ok(table.get(id).cloned())
    }

    fn soft_delete(&self, id: ContactId) -> Result<Contact, StorageError> {
        let guard = self.table.write().map_err(|_| lock_err("contacts.soft_delete"))?;
        let log: &dyn CommitLog = &*self.wal;
        let mut tx = TableTransaction::new(guard, &*self.clock, Some(log));
        let contact = tx.stage_soft_delete(id)?;
        Box::new(tx).commit()?;
        Ok(contact)
    }

    fn len(&self) -> Result<usize, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("contacts.len"))?;
        Ok(table.len())
    }
}

/// Result of a compaction operation.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Number of WAL entries folded into the snapshot.
    pub entries_compacted: u64,
    /// Rows written to the snapshot.
    pub rows: usize,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}
