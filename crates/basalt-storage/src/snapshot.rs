// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Snapshot log recording the page count after every checkpoint.
//!
//! Each entry is 16 bytes (`timestamp i64 LE | page_count u64 LE`) appended
//! to `<branch-dir>/logs/SNAPSHOTS`. The log lets a new branch be created
//! from the state of an existing branch at a point in time.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use basalt_core::BranchKey;
use parking_lot::Mutex;

use crate::error::Result;
use crate::fs::{FileSystem, OpenMode};

const ENTRY_SIZE: usize = 16;

/// One checkpointed state of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Checkpoint timestamp (the WAL version that was checkpointed).
    pub timestamp: i64,
    /// Page count after the checkpoint.
    pub page_count: u64,
}

/// Append-only snapshot log for one branch.
pub struct SnapshotLog {
    file: Mutex<File>,
}

impl SnapshotLog {
    /// Opens (or creates) the snapshot log of a branch.
    pub fn open(fs: &Arc<dyn FileSystem>, branch: &BranchKey) -> Result<Self> {
        let logs = branch.logs_directory();
        fs.mkdir_all(&logs)?;
        let file = fs.open_file(&logs.join("SNAPSHOTS"), OpenMode::ReadWrite)?;
        Ok(Self { file: Mutex::new(file) })
    }

    /// Appends a snapshot entry and syncs it.
    pub fn record(&self, snapshot: Snapshot) -> Result<()> {
        let mut entry = [0u8; ENTRY_SIZE];
        entry[..8].copy_from_slice(&snapshot.timestamp.to_le_bytes());
        entry[8..].copy_from_slice(&snapshot.page_count.to_le_bytes());

        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        // Drop a partial entry left by a crash before appending.
        let aligned = len - len % ENTRY_SIZE as u64;
        if aligned != len {
            file.set_len(aligned)?;
        }
        file.seek(SeekFrom::Start(aligned))?;
        file.write_all(&entry)?;
        file.sync_data()?;
        Ok(())
    }

    /// Returns every snapshot in recording order.
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        read_entries(&mut self.file.lock())
    }

    /// Drops every entry recorded at or after `timestamp` and syncs the log.
    ///
    /// Returns the number of entries dropped.
    pub fn discard_from(&self, timestamp: i64) -> Result<usize> {
        let mut file = self.file.lock();
        let entries = read_entries(&mut file)?;
        let Some(keep) = entries.iter().position(|s| s.timestamp >= timestamp) else {
            return Ok(0);
        };
        file.set_len((keep * ENTRY_SIZE) as u64)?;
        file.sync_all()?;
        Ok(entries.len() - keep)
    }

    /// Returns the latest snapshot taken at or before `timestamp`.
    pub fn snapshot_at(&self, timestamp: i64) -> Result<Option<Snapshot>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.timestamp <= timestamp)
            .max_by_key(|s| s.timestamp))
    }
}

fn read_entries(file: &mut File) -> Result<Vec<Snapshot>> {
    let mut raw = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut raw)?;

    Ok(raw
        .chunks_exact(ENTRY_SIZE)
        .map(|chunk| {
            let mut ts = [0u8; 8];
            let mut count = [0u8; 8];
            ts.copy_from_slice(&chunk[..8]);
            count.copy_from_slice(&chunk[8..]);
            Snapshot { timestamp: i64::from_le_bytes(ts), page_count: u64::from_le_bytes(count) }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::fs::LocalFileSystem;

    #[test]
    fn test_record_and_lookup() {
        let dir = TempDir::new().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()).unwrap());
        let log = SnapshotLog::open(&fs, &BranchKey::new("db", "main")).unwrap();

        assert!(log.snapshot_at(100).unwrap().is_none());

        log.record(Snapshot { timestamp: 10, page_count: 1 }).unwrap();
        log.record(Snapshot { timestamp: 20, page_count: 4 }).unwrap();
        log.record(Snapshot { timestamp: 30, page_count: 6 }).unwrap();

        assert_eq!(log.list().unwrap().len(), 3);
        assert_eq!(log.snapshot_at(25).unwrap(), Some(Snapshot { timestamp: 20, page_count: 4 }));
        assert_eq!(log.snapshot_at(30).unwrap().map(|s| s.page_count), Some(6));
        assert!(log.snapshot_at(5).unwrap().is_none());
    }

    #[test]
    fn test_discard_from_drops_later_entries() {
        let dir = TempDir::new().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()).unwrap());
        let branch = BranchKey::new("db", "main");
        {
            let log = SnapshotLog::open(&fs, &branch).unwrap();
            log.record(Snapshot { timestamp: 10, page_count: 1 }).unwrap();
            log.record(Snapshot { timestamp: 20, page_count: 4 }).unwrap();
            log.record(Snapshot { timestamp: 30, page_count: 6 }).unwrap();

            assert_eq!(log.discard_from(20).unwrap(), 2);
            assert_eq!(log.discard_from(20).unwrap(), 0);
        }

        let log = SnapshotLog::open(&fs, &branch).unwrap();
        assert_eq!(log.list().unwrap(), vec![Snapshot { timestamp: 10, page_count: 1 }]);
        assert_eq!(log.snapshot_at(30).unwrap().map(|s| s.timestamp), Some(10));

        log.record(Snapshot { timestamp: 40, page_count: 2 }).unwrap();
        assert_eq!(log.list().unwrap().len(), 2);
    }
}
