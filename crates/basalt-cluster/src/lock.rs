// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Cross-process locks over the cluster's marker files.
//!
//! Leadership state lives in two small files under `_cluster/` on the
//! shared file system:
//!
//! - `PRIMARY`: the primary's address as raw bytes
//! - `LEASE`: the lease expiry as ASCII decimal unix seconds
//!
//! Both are guarded by advisory locks. [`DistributedLock`] hides the lock
//! backend so election and lease logic do not depend on it.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs2::FileExt;

use crate::error::{ClusterError, Result};

/// Name of the primary marker.
pub const PRIMARY: &str = "PRIMARY";

/// Name of the lease marker.
pub const LEASE: &str = "LEASE";

/// Directory (relative to the cluster root) holding the marker files.
pub const CLUSTER_DIR: &str = "_cluster";

/// Exclusive access to one marker, held until dropped.
pub trait MarkerGuard: Send {
    /// Reads the marker's contents.
    fn read(&mut self) -> Result<Vec<u8>>;

    /// Replaces the marker's contents durably.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Empties the marker.
    fn truncate(&mut self) -> Result<()>;
}

/// A cross-process lock provider for named markers.
pub trait DistributedLock: Send + Sync {
    /// Tries to lock a marker without blocking.
    ///
    /// Returns `Ok(None)` if another holder has it.
    fn try_lock(&self, name: &'static str) -> Result<Option<Box<dyn MarkerGuard>>>;

    /// Reads a marker without locking it.
    fn read(&self, name: &'static str) -> Result<Vec<u8>>;
}

/// Marker locks backed by `flock`-style advisory file locks.
#[derive(Debug, Clone)]
pub struct FileLock {
    dir: PathBuf,
}

impl FileLock {
    /// Creates a lock provider rooted at `root/_cluster`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let dir = root.into().join(CLUSTER_DIR);
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn open(&self, name: &str) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(name))?)
    }
}

impl DistributedLock for FileLock {
    fn try_lock(&self, name: &'static str) -> Result<Option<Box<dyn MarkerGuard>>> {
        let file = self.open(name)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Box::new(FileMarkerGuard { file }))),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(ClusterError::Io(e)),
        }
    }

    fn read(&self, name: &'static str) -> Result<Vec<u8>> {
        match std::fs::read(self.dir.join(name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

struct FileMarkerGuard {
    file: File,
}

impl MarkerGuard for FileMarkerGuard {
    fn read(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(data)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for FileMarkerGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "Failed to unlock cluster marker");
        }
    }
}

/// Parses a `LEASE` marker into its expiry (unix seconds).
///
/// An empty marker means no lease.
pub fn parse_lease(raw: &[u8]) -> Result<Option<i64>> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| ClusterError::InvalidMarker { what: LEASE, reason: e.to_string() })?
        .trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse()
        .map(Some)
        .map_err(|e: std::num::ParseIntError| ClusterError::InvalidMarker {
            what: LEASE,
            reason: e.to_string(),
        })
}

/// Parses a `PRIMARY` marker into an address. An empty marker means no primary.
pub fn parse_primary(raw: &[u8]) -> Option<String> {
    let address = String::from_utf8_lossy(raw).trim().to_string();
    (!address.is_empty()).then_some(address)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_second_lock_is_refused_until_released() {
        let dir = TempDir::new().unwrap();
        let a = FileLock::new(dir.path()).unwrap();
        let b = FileLock::new(dir.path()).unwrap();

        let guard = a.try_lock(PRIMARY).unwrap().expect("first lock");
        assert!(b.try_lock(PRIMARY).unwrap().is_none());
        // Other markers are independent.
        assert!(b.try_lock(LEASE).unwrap().is_some());

        drop(guard);
        assert!(b.try_lock(PRIMARY).unwrap().is_some());
    }

    #[test]
    fn test_guard_read_write_truncate() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path()).unwrap();
        assert!(lock.read(PRIMARY).unwrap().is_empty());

        {
            let mut guard = lock.try_lock(PRIMARY).unwrap().unwrap();
            guard.write(b"10.0.0.1:7000").unwrap();
            guard.write(b"10.0.0.2:7000").unwrap();
            assert_eq!(guard.read().unwrap(), b"10.0.0.2:7000");
        }
        assert_eq!(parse_primary(&lock.read(PRIMARY).unwrap()).as_deref(), Some("10.0.0.2:7000"));

        let mut guard = lock.try_lock(PRIMARY).unwrap().unwrap();
        guard.truncate().unwrap();
        assert_eq!(parse_primary(&guard.read().unwrap()), None);
    }

    #[test]
    fn test_parse_lease() {
        assert_eq!(parse_lease(b"").unwrap(), None);
        assert_eq!(parse_lease(b"1700000000\n").unwrap(), Some(1_700_000_000));
        assert!(parse_lease(b"soon").is_err());
    }
}
