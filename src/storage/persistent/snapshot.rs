//! Snapshot file holding the full contact table as of the last compaction.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte][codec-encoded SnapshotData]
//! ```
//!
//! Snapshots are written to a temporary file, synced, then renamed over the
//! previous snapshot, so a crash leaves either the old or the new file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Result as IoResult, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::Contact;

use super::codec;

/// Contents of a snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    /// When the snapshot was taken.
    pub written_at: DateTime<Utc>,
    /// Every row, soft-deleted rows included.
    pub contacts: Vec<Contact>,
}

/// Atomically replace the snapshot at `path`.
pub fn write_snapshot(path: &Path, data: &SnapshotData, sync: bool) -> IoResult<()> {
    let tmp = path.with_extension("snap.tmp");
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;
        writer.write_all(&codec::encode(data)?)?;
        writer.flush()?;
        if sync {
            writer.get_ref().sync_all()?;
        }
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load the snapshot at `path`, if one has been written.
pub fn read_snapshot(path: &Path) -> IoResult<Option<SnapshotData>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = BufReader::new(File::open(path)?);
    let _version = codec::read_header(&mut reader)?;
    codec::decode(&mut reader).map(Some)
}
