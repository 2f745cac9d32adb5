// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! A single WAL version backed by one file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use basalt_core::{unix_nanos, BranchKey, NodeRole};
use parking_lot::Mutex;
use tracing::{error, trace};

use super::cache::LfuCache;
use crate::error::{Result, StorageError};
use crate::fs::{FileSystem, OpenMode};

/// Tunables shared by every segment of a branch.
#[derive(Debug, Clone, Copy)]
pub struct WalOptions {
    /// Maximum number of cached read/write ranges per segment.
    pub cache_capacity: usize,
    /// Minimum time between two fsyncs.
    pub sync_interval: Duration,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self { cache_capacity: 1024, sync_interval: Duration::from_millis(100) }
    }
}

impl From<&basalt_core::StorageConfig> for WalOptions {
    fn from(config: &basalt_core::StorageConfig) -> Self {
        Self { cache_capacity: config.wal_cache_capacity, sync_interval: config.wal_sync_interval() }
    }
}

/// Returns the relative path of a WAL version's file.
#[must_use]
pub fn wal_path(branch: &BranchKey, timestamp: i64) -> PathBuf {
    wal_directory(branch).join(format!("WAL_{timestamp}"))
}

/// Returns the relative directory holding a branch's WAL versions.
#[must_use]
pub fn wal_directory(branch: &BranchKey) -> PathBuf {
    branch.logs_directory().join("wal")
}

/// Parses the version out of a `WAL_<timestamp>` file name.
#[must_use]
pub fn parse_wal_file_name(name: &str) -> Option<i64> {
    name.strip_prefix("WAL_")?.parse().ok()
}

/// One durable WAL version.
///
/// The segment is an append-only byte range addressed by absolute offset.
/// Small repeated reads and writes (frame headers, hot pages) are absorbed
/// by a bounded LFU cache keyed by offset. Once [`mark_checkpointed`] has been
/// called the segment is frozen: reads and writes fail.
///
/// [`mark_checkpointed`]: DatabaseWal::mark_checkpointed
pub struct DatabaseWal {
    fs: Arc<dyn FileSystem>,
    branch: BranchKey,
    timestamp: i64,
    path: PathBuf,
    file: Mutex<File>,
    writable: AtomicBool,
    cache: Mutex<LfuCache<u64, Vec<u8>>>,
    role: Arc<dyn NodeRole>,
    size: AtomicU64,
    checkpointed_at: AtomicI64,
    checkpointing: AtomicBool,
    last_write_time: AtomicI64,
    created_at: Instant,
    last_sync: Mutex<Option<Instant>>,
    sync_interval: Duration,
}

impl DatabaseWal {
    /// Opens the segment for `timestamp`.
    ///
    /// The primary creates the file if needed; other nodes open an existing
    /// file read-only and reopen it for writing after a promotion.
    pub fn open(
        fs: &Arc<dyn FileSystem>,
        branch: &BranchKey,
        timestamp: i64,
        role: Arc<dyn NodeRole>,
        options: WalOptions,
    ) -> Result<Self> {
        let path = wal_path(branch, timestamp);
        let writable = role.is_primary();
        let file = if writable { fs.open_file(&path, OpenMode::ReadWrite)? } else { fs.open(&path)? };
        let size = file.metadata()?.len();

        Ok(Self {
            fs: Arc::clone(fs),
            branch: branch.clone(),
            timestamp,
            path,
            file: Mutex::new(file),
            writable: AtomicBool::new(writable),
            cache: Mutex::new(LfuCache::new(options.cache_capacity)),
            role,
            size: AtomicU64::new(size),
            checkpointed_at: AtomicI64::new(0),
            checkpointing: AtomicBool::new(false),
            last_write_time: AtomicI64::new(0),
            created_at: Instant::now(),
            last_sync: Mutex::new(None),
            sync_interval: options.sync_interval,
        })
    }

    /// Version identifier (creation time in nanoseconds).
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Branch this segment belongs to.
    pub fn branch(&self) -> &BranchKey {
        &self.branch
    }

    /// Relative path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size in bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// When the segment was checkpointed (ns since epoch), zero if never.
    pub fn checkpointed_at(&self) -> i64 {
        self.checkpointed_at.load(Ordering::SeqCst)
    }

    /// Returns true once the segment has been checkpointed.
    pub fn is_checkpointed(&self) -> bool {
        self.checkpointed_at() != 0
    }

    /// Freezes the segment.
    pub fn mark_checkpointed(&self) {
        self.checkpointed_at.store(unix_nanos().max(1), Ordering::SeqCst);
        self.checkpointing.store(false, Ordering::SeqCst);
        self.cache.lock().clear();
    }

    /// Returns true while a checkpoint of this segment is running.
    pub fn is_checkpointing(&self) -> bool {
        self.checkpointing.load(Ordering::SeqCst)
    }

    /// Flags the segment as being checkpointed.
    pub fn set_checkpointing(&self, checkpointing: bool) {
        self.checkpointing.store(checkpointing, Ordering::SeqCst);
    }

    /// Time of the last write (ns since epoch), zero if never written.
    pub fn last_write_time(&self) -> i64 {
        self.last_write_time.load(Ordering::SeqCst)
    }

    /// Reads `buf.len()` bytes at `offset`, returning the number read.
    ///
    /// Fails with [`StorageError::InvariantViolated`] once the segment is
    /// checkpointed: checkpointed data must be read from the page store.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if self.is_checkpointed() {
            error!(
                branch = %self.branch,
                version = self.timestamp,
                offset,
                "Read from a checkpointed WAL version"
            );
            return Err(StorageError::InvariantViolated(format!(
                "read from checkpointed WAL version {}",
                self.timestamp
            )));
        }

        {
            let mut cache = self.cache.lock();
            if let Some(cached) = cache.get(&offset) {
                if cached.len() >= buf.len() {
                    buf.copy_from_slice(&cached[..buf.len()]);
                    trace!(version = self.timestamp, offset, len = buf.len(), "WAL cache hit");
                    return Ok(buf.len());
                }
            }
        }

        // Lock order is file then cache; the cache is filled before the file
        // lock is released.
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == buf.len() && filled > 0 {
            self.cache.lock().put(offset, buf.to_vec());
        }
        Ok(filled)
    }

    /// Writes `buf` at `offset`. Only the primary may write.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if !self.role.is_primary() {
            return Err(StorageError::WriteOnReplica { version: self.timestamp });
        }
        if self.is_checkpointed() {
            error!(branch = %self.branch, version = self.timestamp, "Write to a checkpointed WAL version");
            return Err(StorageError::InvariantViolated(format!(
                "write to checkpointed WAL version {}",
                self.timestamp
            )));
        }

        let end = offset + buf.len() as u64;
        {
            let mut file = self.file.lock();
            if !self.writable.load(Ordering::SeqCst) {
                *file = self.fs.open_file(&self.path, OpenMode::ReadWrite)?;
                self.writable.store(true, Ordering::SeqCst);
            }
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)?;

            let mut cache = self.cache.lock();
            // Cached ranges overlapping the write would go stale.
            cache.retain(|start, data| {
                let cached_end = *start + data.len() as u64;
                cached_end <= offset || *start >= end
            });
            cache.put(offset, buf.to_vec());
        }

        self.size.fetch_max(end, Ordering::SeqCst);
        self.last_write_time.store(unix_nanos(), Ordering::SeqCst);
        Ok(buf.len())
    }

    /// Flushes the segment to stable storage, at most once per sync interval.
    ///
    /// Returns true if an fsync was actually issued. Only the primary syncs.
    pub fn sync(&self) -> Result<bool> {
        if !self.role.is_primary() {
            return Ok(false);
        }

        let now = Instant::now();
        if now.duration_since(self.created_at) < self.sync_interval {
            return Ok(false);
        }

        let mut last_sync = self.last_sync.lock();
        if let Some(previous) = *last_sync {
            if now.duration_since(previous) < self.sync_interval {
                return Ok(false);
            }
        }

        self.file.lock().sync_data()?;
        *last_sync = Some(now);
        Ok(true)
    }

    /// Does nothing.
    ///
    /// WAL versions are immutable once written; instead of truncating, the
    /// manager rotates to a new version after a checkpoint.
    pub fn truncate(&self, _size: u64) -> Result<()> {
        Ok(())
    }

    /// Returns true if the segment holds data that has not been checkpointed.
    pub fn requires_checkpoint(&self) -> bool {
        !self.is_checkpointed() && (self.size() > 0 || self.last_write_time() > 0)
    }
}

impl std::fmt::Debug for DatabaseWal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseWal")
            .field("branch", &self.branch)
            .field("timestamp", &self.timestamp)
            .field("size", &self.size())
            .field("checkpointed_at", &self.checkpointed_at())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use basalt_core::FixedRole;
    use tempfile::TempDir;

    use super::*;
    use crate::fs::LocalFileSystem;

    fn setup(role: Arc<FixedRole>, options: WalOptions) -> (TempDir, DatabaseWal) {
        let dir = TempDir::new().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()).unwrap());
        let branch = BranchKey::new("db", "main");
        fs.mkdir_all(&wal_directory(&branch)).unwrap();
        let wal = DatabaseWal::open(&fs, &branch, 42, role, options).unwrap();
        (dir, wal)
    }

    #[test]
    fn test_wal_file_names() {
        let branch = BranchKey::new("db", "main");
        assert_eq!(wal_path(&branch, 17), PathBuf::from("db/main/logs/wal/WAL_17"));
        assert_eq!(parse_wal_file_name("WAL_17"), Some(17));
        assert_eq!(parse_wal_file_name("WAL_x"), None);
        assert_eq!(parse_wal_file_name("CHECKPOINT"), None);
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, wal) = setup(Arc::new(FixedRole::primary()), WalOptions::default());
        assert!(!wal.requires_checkpoint());

        wal.write_at(b"frame-header-24-bytes!!!", 32).unwrap();
        assert_eq!(wal.size(), 56);
        assert!(wal.requires_checkpoint());

        let mut buf = [0u8; 24];
        assert_eq!(wal.read_at(&mut buf, 32).unwrap(), 24);
        assert_eq!(&buf, b"frame-header-24-bytes!!!");
    }

    #[test]
    fn test_read_through_uncached() {
        let options = WalOptions { cache_capacity: 0, ..Default::default() };
        let (_dir, wal) = setup(Arc::new(FixedRole::primary()), options);
        wal.write_at(&[5u8; 100], 0).unwrap();

        let mut buf = [0u8; 10];
        assert_eq!(wal.read_at(&mut buf, 90).unwrap(), 10);
        assert_eq!(buf, [5u8; 10]);

        // Short read past the end.
        let mut buf = [0u8; 10];
        assert_eq!(wal.read_at(&mut buf, 95).unwrap(), 5);
    }

    #[test]
    fn test_overlapping_write_invalidates_cache() {
        let (_dir, wal) = setup(Arc::new(FixedRole::primary()), WalOptions::default());
        wal.write_at(&[1u8; 64], 0).unwrap();
        wal.write_at(&[2u8; 8], 16).unwrap();

        let mut buf = [0u8; 64];
        wal.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..16], &[1u8; 16]);
        assert_eq!(&buf[16..24], &[2u8; 8]);
        assert_eq!(&buf[24..], &[1u8; 40]);
    }

    #[test]
    fn test_checkpointed_segment_rejects_io() {
        let (_dir, wal) = setup(Arc::new(FixedRole::primary()), WalOptions::default());
        wal.write_at(b"data", 0).unwrap();
        wal.mark_checkpointed();

        assert!(wal.is_checkpointed());
        assert!(!wal.requires_checkpoint());

        let mut buf = [0u8; 4];
        assert!(matches!(wal.read_at(&mut buf, 0), Err(StorageError::InvariantViolated(_))));
        assert!(matches!(wal.write_at(b"more", 4), Err(StorageError::InvariantViolated(_))));
    }

    #[test]
    fn test_replica_cannot_write_or_sync() {
        let role = Arc::new(FixedRole::primary());
        let (_dir, wal) = setup(
            Arc::clone(&role),
            WalOptions { sync_interval: Duration::ZERO, ..Default::default() },
        );

        for membership in [basalt_core::Membership::Replica, basalt_core::Membership::Idle] {
            role.set(membership);
            assert!(matches!(
                wal.write_at(b"x", 0),
                Err(StorageError::WriteOnReplica { version: 42 })
            ));
            assert!(!wal.sync().unwrap());
        }
    }

    #[test]
    fn test_promoted_node_reopens_for_writing() {
        let dir = TempDir::new().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()).unwrap());
        let branch = BranchKey::new("db", "main");
        fs.mkdir_all(&wal_directory(&branch)).unwrap();
        fs.write_file(&wal_path(&branch, 7), b"old").unwrap();

        let role = Arc::new(FixedRole::replica());
        let wal =
            DatabaseWal::open(&fs, &branch, 7, Arc::clone(&role) as Arc<dyn NodeRole>, WalOptions::default())
                .unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(wal.read_at(&mut buf, 0).unwrap(), 3);

        role.set(basalt_core::Membership::Primary);
        wal.write_at(b"new", 3).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(wal.read_at(&mut buf, 0).unwrap(), 6);
        assert_eq!(&buf, b"oldnew");
    }

    #[test]
    fn test_concurrent_reads_never_cache_stale_bytes() {
        let (_dir, wal) = setup(Arc::new(FixedRole::primary()), WalOptions::default());
        let wal = Arc::new(wal);
        wal.write_at(&[0u8; 8], 0).unwrap();

        let reader = {
            let wal = Arc::clone(&wal);
            std::thread::spawn(move || {
                let mut buf = [0u8; 8];
                for _ in 0..2_000 {
                    wal.read_at(&mut buf, 0).unwrap();
                }
            })
        };
        for i in 1..=200u8 {
            wal.write_at(&[i; 8], 0).unwrap();
        }
        reader.join().unwrap();

        let mut buf = [0u8; 8];
        wal.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [200u8; 8]);
    }

    #[test]
    fn test_sync_is_throttled() {
        let options = WalOptions { sync_interval: Duration::from_millis(50), ..Default::default() };
        let (_dir, wal) = setup(Arc::new(FixedRole::primary()), options);
        wal.write_at(b"x", 0).unwrap();

        // Too soon after creation.
        assert!(!wal.sync().unwrap());

        std::thread::sleep(Duration::from_millis(60));
        assert!(wal.sync().unwrap());
        // Too soon after the previous sync.
        assert!(!wal.sync().unwrap());
    }

    #[test]
    fn test_truncate_is_noop() {
        let (_dir, wal) = setup(Arc::new(FixedRole::primary()), WalOptions::default());
        wal.write_at(&[1u8; 10], 0).unwrap();
        wal.truncate(0).unwrap();
        assert_eq!(wal.size(), 10);
    }
}
