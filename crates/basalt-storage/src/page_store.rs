// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Durable page storage for one branch.
//!
//! Pages are 1-based and stored back to back in `<branch-dir>/pages/DATA`.
//! The logical page count lives in `<branch-dir>/pages/METADATA`; pages past
//! the page count may exist physically during a checkpoint but are not part
//! of the database until the count is raised.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use basalt_core::BranchKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::fs::{FileSystem, OpenMode};

/// Durable metadata describing the page store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageStoreMetadata {
    /// Number of pages that are part of the database.
    pub page_count: u64,
    /// Size of each page in bytes.
    pub page_size: u32,
}

/// Page storage for one branch.
pub struct PageStore {
    fs: Arc<dyn FileSystem>,
    metadata_path: PathBuf,
    metadata: Mutex<PageStoreMetadata>,
    data: Mutex<File>,
}

impl PageStore {
    /// Opens (or creates) the page store of a branch.
    ///
    /// An existing store keeps its recorded page size; `page_size` only
    /// applies to new stores. Metadata is first written when the page count
    /// is.
    pub fn open(fs: Arc<dyn FileSystem>, branch: &BranchKey, page_size: u32) -> Result<Self> {
        let dir = branch.directory().join("pages");
        fs.mkdir_all(&dir)?;

        let metadata_path = dir.join("METADATA");
        let metadata = read_metadata(fs.as_ref(), &metadata_path)?
            .unwrap_or(PageStoreMetadata { page_count: 0, page_size });

        let data = fs.open_file(&dir.join("DATA"), OpenMode::ReadWrite)?;

        Ok(Self { fs, metadata_path, metadata: Mutex::new(metadata), data: Mutex::new(data) })
    }

    /// Re-reads the recorded metadata, picking up page counts written by
    /// another process.
    pub fn reload(&self) -> Result<()> {
        if let Some(metadata) = read_metadata(self.fs.as_ref(), &self.metadata_path)? {
            *self.metadata.lock() = metadata;
        }
        Ok(())
    }

    /// Returns a copy of the current metadata.
    pub fn metadata(&self) -> PageStoreMetadata {
        *self.metadata.lock()
    }

    /// Returns the number of pages in the database.
    pub fn page_count(&self) -> u64 {
        self.metadata.lock().page_count
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.metadata.lock().page_size
    }

    /// Reads a page that is part of the database.
    ///
    /// Returns `None` for pages beyond the page count.
    pub fn read_page(&self, page_number: u64) -> Result<Option<Vec<u8>>> {
        if page_number == 0 {
            return Err(StorageError::InvalidPage(page_number));
        }
        let PageStoreMetadata { page_count, page_size } = self.metadata();
        if page_number > page_count {
            return Ok(None);
        }

        let mut buf = vec![0u8; page_size as usize];
        let mut file = self.data.lock();
        file.seek(SeekFrom::Start((page_number - 1) * u64::from(page_size)))?;

        // Pages that were counted but never physically written read as zeros.
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(Some(buf))
    }

    /// Writes a page. Does not change the page count.
    pub fn write_page(&self, page_number: u64, data: &[u8]) -> Result<()> {
        if page_number == 0 {
            return Err(StorageError::InvalidPage(page_number));
        }
        let page_size = self.page_size();
        if data.len() != page_size as usize {
            return Err(StorageError::Corrupt {
                what: "page",
                reason: format!("expected {page_size} bytes, got {}", data.len()),
            });
        }

        let mut file = self.data.lock();
        file.seek(SeekFrom::Start((page_number - 1) * u64::from(page_size)))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Flushes written pages to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.data.lock().sync_data()?;
        Ok(())
    }

    /// Durably records a new page count.
    pub fn set_page_count(&self, page_count: u64) -> Result<()> {
        let mut metadata = self.metadata.lock();
        let updated = PageStoreMetadata { page_count, ..*metadata };
        self.fs.write_file(&self.metadata_path, &serde_json::to_vec(&updated)?)?;
        *metadata = updated;
        Ok(())
    }

    /// Resets the page count and drops any pages beyond it.
    pub fn truncate(&self, page_count: u64) -> Result<()> {
        self.set_page_count(page_count)?;
        let page_size = u64::from(self.page_size());
        let file = self.data.lock();
        file.set_len(page_count * page_size)?;
        file.sync_all()?;
        Ok(())
    }
}

fn read_metadata(fs: &dyn FileSystem, path: &Path) -> Result<Option<PageStoreMetadata>> {
    if !fs.exists(path)? {
        return Ok(None);
    }
    let raw = fs.read_file(path)?;
    let metadata = serde_json::from_slice(&raw).map_err(|e| StorageError::Corrupt {
        what: "page store metadata",
        reason: e.to_string(),
    })?;
    Ok(Some(metadata))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::fs::LocalFileSystem;

    fn open_store(dir: &TempDir) -> PageStore {
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()).unwrap());
        PageStore::open(fs, &BranchKey::new("db", "main"), 512).unwrap()
    }

    #[test]
    fn test_new_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert_eq!(store.metadata(), PageStoreMetadata { page_count: 0, page_size: 512 });
        assert_eq!(store.read_page(1).unwrap(), None);
        assert!(matches!(store.read_page(0), Err(StorageError::InvalidPage(0))));
    }

    #[test]
    fn test_pages_hidden_until_counted() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.write_page(2, &[7u8; 512]).unwrap();
        assert_eq!(store.read_page(2).unwrap(), None);

        store.set_page_count(2).unwrap();
        assert_eq!(store.read_page(2).unwrap(), Some(vec![7u8; 512]));
        // Page 1 was never written and reads as zeros.
        assert_eq!(store.read_page(1).unwrap(), Some(vec![0u8; 512]));
    }

    #[test]
    fn test_metadata_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.write_page(1, &[1u8; 512]).unwrap();
            store.set_page_count(1).unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.page_count(), 1);
        assert_eq!(store.read_page(1).unwrap(), Some(vec![1u8; 512]));
    }

    #[test]
    fn test_open_leaves_disk_untouched_and_reload_follows_writer() {
        let dir = TempDir::new().unwrap();
        let reader = open_store(&dir);
        let metadata = BranchKey::new("db", "main").directory().join("pages").join("METADATA");
        assert!(!dir.path().join(&metadata).exists());

        let writer = open_store(&dir);
        writer.write_page(1, &[3u8; 512]).unwrap();
        writer.set_page_count(1).unwrap();

        assert_eq!(reader.page_count(), 0);
        reader.reload().unwrap();
        assert_eq!(reader.page_count(), 1);
        assert_eq!(reader.read_page(1).unwrap(), Some(vec![3u8; 512]));
    }

    #[test]
    fn test_truncate_drops_pages() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.write_page(1, &[1u8; 512]).unwrap();
        store.write_page(2, &[2u8; 512]).unwrap();
        store.set_page_count(2).unwrap();

        store.truncate(1).unwrap();
        assert_eq!(store.page_count(), 1);

        store.set_page_count(2).unwrap();
        assert_eq!(store.read_page(2).unwrap(), Some(vec![0u8; 512]));
    }

    #[test]
    fn test_rejects_wrong_page_size() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.write_page(1, &[0u8; 100]).is_err());
    }
}
