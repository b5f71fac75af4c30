//! Write-Ahead Log (WAL) for crash recovery.
//!
//! Every committed transaction is appended as one [`WalEntryKind::Commit`]
//! record holding the full post-commit image of each changed row. Replaying
//! a record is an upsert, so replaying the same record twice is harmless.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::clock::{Clock, SystemClock};
use crate::contact::Contact;
use crate::storage::table::CommitLog;
use crate::storage::traits::StorageError;

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The operation being logged.
    pub kind: WalEntryKind,
}

/// The type of WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// Row images written by one committed transaction.
    Commit { rows: Vec<Contact> },

    /// Everything up to this point is contained in the snapshot file.
    Checkpoint { up_to_sequence: u64 },
}

fn poisoned(context: &'static str) -> IoError {
    IoError::new(ErrorKind::Other, format!("poisoned lock: {context}"))
}

/// The append end of the log file.
///
/// Records are written unbuffered so a failed append can be cut back off
/// the file before anything else is written after it.
pub(crate) trait LogFile: Write + Send {
    fn len(&self) -> IoResult<u64>;
    fn set_len(&self, len: u64) -> IoResult<()>;
    fn sync(&self) -> IoResult<()>;
}

impl LogFile for File {
    fn len(&self) -> IoResult<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> IoResult<()> {
        File::set_len(self, len)
    }

    fn sync(&self) -> IoResult<()> {
        self.sync_all()
    }
}

fn open_append(path: &Path) -> IoResult<Box<dyn LogFile>> {
    Ok(Box::new(OpenOptions::new().append(true).open(path)?))
}

/// Write-Ahead Log for crash recovery.
///
/// Thread-safe via internal mutex. An append either lands as one whole
/// record or leaves the file as it was; if the file cannot be restored the
/// log refuses further appends until it is reopened.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<Box<dyn LogFile>>,
    current_sequence: Mutex<u64>,
    sync_on_write: bool,
    broken: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl WriteAheadLog {
    /// Open or create a WAL file stamped with wall-clock time.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        Self::open_with_clock(path, sync_on_write, Arc::new(SystemClock))
    }

    /// Open or create a WAL file.
    ///
    /// If the file exists, reads the last valid sequence number.
    /// If the file doesn't exist, creates it with the header.
    pub fn open_with_clock(
        path: &Path,
        sync_on_write: bool,
        clock: Arc<dyn Clock>,
    ) -> IoResult<Self> {
        let exists = path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let current_sequence = if exists && file.metadata()?.len() >= codec::HEADER_LEN {
            let (last_seq, valid_end) = Self::scan(path)?;
            if let Some(end) = valid_end {
                // Drop a torn trailing record so new appends start on a boundary.
                warn!(offset = end, "truncating torn WAL tail");
                file.set_len(end)?;
            }
            last_seq
        } else {
            let mut file = file;
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(open_append(path)?),
            current_sequence: Mutex::new(current_sequence),
            sync_on_write,
            broken: AtomicBool::new(false),
            clock,
        })
    }

    fn lock_writer(&self) -> IoResult<MutexGuard<'_, Box<dyn LogFile>>> {
        self.writer.lock().map_err(|_| poisoned("wal.writer"))
    }

    fn lock_sequence(&self) -> IoResult<MutexGuard<'_, u64>> {
        self.current_sequence.lock().map_err(|_| poisoned("wal.sequence"))
    }

    /// Append an entry to the WAL.
    ///
    /// Returns the sequence number assigned to this entry.
    ///
    /// On failure the file is cut back to its previous length, so the record
    /// can never surface on a later replay.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(IoError::new(
                ErrorKind::Other,
                "WAL holds a partial record that could not be removed; reopen the database",
            ));
        }

        let mut writer = self.lock_writer()?;
        let mut seq_guard = self.lock_sequence()?;

        let candidate = *seq_guard + 1;
        let entry = WalEntry {
            sequence: candidate,
            timestamp: self.clock.now(),
            kind,
        };
        let encoded = codec::encode(&entry)?;

        let start = writer.len()?;
        if let Err(e) = Self::write_record(&mut **writer, &encoded, self.sync_on_write) {
            match writer.set_len(start) {
                Ok(()) => warn!(sequence = candidate, error = %e, "WAL append failed, record discarded"),
                Err(undo) => {
                    self.broken.store(true, Ordering::SeqCst);
                    error!(sequence = candidate, error = %e, rollback_error = %undo, "WAL append failed and could not be undone");
                }
            }
            return Err(e);
        }

        *seq_guard = candidate;
        Ok(candidate)
    }

    fn write_record(file: &mut dyn LogFile, encoded: &[u8], sync: bool) -> IoResult<()> {
        file.write_all(encoded)?;
        file.flush()?;
        if sync {
            file.sync()?;
        }
        Ok(())
    }

    /// Iterate over all entries in the WAL.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Get the current sequence number.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(*self.lock_sequence()?)
    }

    /// Get the WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Reset the WAL to an empty file after a snapshot has been written.
    ///
    /// Only call this after the snapshot covering every entry is durable.
    pub fn truncate(&self) -> IoResult<()> {
        let mut writer = self.lock_writer()?;

        let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        codec::write_header(&mut file)?;
        if self.sync_on_write {
            file.sync_all()?;
        }

        *self.lock_sequence()? = 0;
        *writer = open_append(&self.path)?;
        self.broken.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Returns the last valid sequence number, plus the offset to cut the
    /// file at when it ends in a torn record.
    fn scan(path: &Path) -> IoResult<(u64, Option<u64>)> {
        let mut iter = WalIterator::new(path)?;
        let mut last_seq = 0;
        let mut valid_end = iter.position()?;
        loop {
            match iter.next() {
                Some(Ok(entry)) => {
                    last_seq = entry.sequence;
                    valid_end = iter.position()?;
                }
                Some(Err(e)) => {
                    // Replay reports the same corruption as a hard error.
                    warn!(sequence = last_seq + 1, error = %e, "WAL corruption detected");
                    return Ok((last_seq, None));
                }
                None => break,
            }
        }
        let torn = valid_end < iter.file_size;
        Ok((last_seq, torn.then_some(valid_end)))
    }
}

#[cfg(test)]
impl WriteAheadLog {
    /// Route appends through a file that stops accepting bytes whenever
    /// `disk_full` is set.
    pub(crate) fn fail_writes_while(&self, disk_full: Arc<AtomicBool>) -> IoResult<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        *self.lock_writer()? = Box::new(testing::FullDisk { file, disk_full });
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Writes a few bytes, then fails with ENOSPC while the switch is on.
    pub(crate) struct FullDisk {
        pub(super) file: File,
        pub(super) disk_full: Arc<AtomicBool>,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
            if !self.disk_full.load(Ordering::SeqCst) {
                return self.file.write(buf);
            }
            if buf.len() > 7 {
                return self.file.write(&buf[..7]);
            }
            Err(IoError::new(ErrorKind::Other, "No space left on device"))
        }

        fn flush(&mut self) -> IoResult<()> {
            self.file.flush()
        }
    }

    impl LogFile for FullDisk {
        fn len(&self) -> IoResult<u64> {
            LogFile::len(&self.file)
        }

        fn set_len(&self, len: u64) -> IoResult<()> {
            LogFile::set_len(&self.file, len)
        }

        fn sync(&self) -> IoResult<()> {
            self.file.sync_all()
        }
    }
}

impl CommitLog for WriteAheadLog {
    fn append_commit(&self, changes: &[Contact]) -> Result<(), StorageError> {
        self.append(WalEntryKind::Commit {
            rows: changes.to_vec(),
        })?;
        Ok(())
    }
}

/// Iterator over WAL entries.
///
/// A torn final record (crash mid-append) ends iteration quietly; any other
/// decode failure is yielded as an error.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let _version = codec::read_header(&mut reader)?;
        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }

    fn at_eof(&mut self) -> IoResult<bool> {
        Ok(self.position()? >= self.file_size)
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.at_eof() {
            Ok(true) => return None,
            Ok(false) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    use chrono::TimeZone;

    use crate::clock::ManualClock;
    use crate::contact::{ContactId, LinkPrecedence};

    fn row(id: u64) -> Contact {
        let now = Utc::now();
        Contact {
            id: ContactId::new(id),
            email: Some(format!("c{id}@hillvalley.edu")),
            phone_number: None,
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn test_wal_append_and_iterate_across_reopen() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let wal = WriteAheadLog::open(&wal_path, false).unwrap();
            wal.append_commit(&[row(1)]).unwrap();
            wal.append_commit(&[row(1), row(2)]).unwrap();
            assert_eq!(wal.current_sequence().unwrap(), 2);
        }

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);

        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        let WalEntryKind::Commit { rows } = &entries[1].kind else {
            panic!("expected commit entry");
        };
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_torn_tail_is_cut_before_new_appends() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("torn.wal");

        {
            let wal = WriteAheadLog::open(&wal_path, false).unwrap();
            wal.append_commit(&[row(1)]).unwrap();
            wal.append_commit(&[row(2)]).unwrap();
        }
        let len = std::fs::metadata(&wal_path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&wal_path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        {
            let wal = WriteAheadLog::open(&wal_path, false).unwrap();
            assert_eq!(wal.current_sequence().unwrap(), 1);
            wal.append_commit(&[row(3)]).unwrap();
        }

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 2);
    }

    #[test]
    fn test_failed_append_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("full.wal");
        let disk_full = Arc::new(AtomicBool::new(false));

        {
            let wal = WriteAheadLog::open(&wal_path, false).unwrap();
            wal.append_commit(&[row(1)]).unwrap();
            let len_before = wal.size_bytes().unwrap();

            wal.fail_writes_while(Arc::clone(&disk_full)).unwrap();
            disk_full.store(true, Ordering::SeqCst);
            assert!(wal.append_commit(&[row(2)]).is_err());
            assert_eq!(wal.size_bytes().unwrap(), len_before);
            assert_eq!(wal.current_sequence().unwrap(), 1);

            disk_full.store(false, Ordering::SeqCst);
            wal.append_commit(&[row(3)]).unwrap();
        }

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 2);
        let WalEntryKind::Commit { rows } = &entries[1].kind else {
            panic!("expected commit entry");
        };
        assert_eq!(rows[0].id, ContactId::new(3));
    }

    #[test]
    fn test_entries_are_stamped_by_injected_clock() {
        let dir = tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(1985, 10, 26, 1, 21, 0).unwrap();
        let wal = WriteAheadLog::open_with_clock(
            &dir.path().join("clock.wal"),
            false,
            Arc::new(ManualClock::new(at)),
        )
        .unwrap();
        wal.append_commit(&[row(1)]).unwrap();

        let entry = wal.iter().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.timestamp, at);
    }

    #[test]
    fn test_truncate_resets_log() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("trunc.wal");

        let wal = WriteAheadLog::open(&wal_path, true).unwrap();
        wal.append_commit(&[row(1)]).unwrap();
        wal.truncate().unwrap();

        assert_eq!(wal.current_sequence().unwrap(), 0);
        assert_eq!(wal.size_bytes().unwrap(), codec::HEADER_LEN);
        assert_eq!(wal.iter().unwrap().count(), 0);

        wal.append_commit(&[row(2)]).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 1);
    }
}
