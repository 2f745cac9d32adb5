// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Versioned page log used for reads at a point in time.
//!
//! Every page a checkpoint writes is also logged under the checkpoint's
//! timestamp. A rolled-back checkpoint tombstones its timestamp so readers
//! never observe the discarded page images.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::RwLock;

use crate::error::Result;

/// Operations the checkpointer needs from the page logger.
pub trait PageLogger: Send + Sync {
    /// Pins `timestamp` so its entries are not compacted while in use.
    fn acquire(&self, timestamp: i64);

    /// Unpins `timestamp`.
    fn release(&self, timestamp: i64);

    /// Hides every entry written under `timestamp`.
    fn tombstone(&self, timestamp: i64) -> Result<()>;

    /// Logs a page image under `timestamp`.
    fn write(&self, page_number: u64, timestamp: i64, data: &[u8]) -> Result<()>;

    /// Returns the newest live image of a page at or before `timestamp`.
    fn read(&self, page_number: u64, timestamp: i64) -> Option<Vec<u8>>;
}

#[derive(Default)]
struct MemoryPageLoggerInner {
    pages: HashMap<u64, BTreeMap<i64, Vec<u8>>>,
    tombstones: HashSet<i64>,
    pins: HashMap<i64, usize>,
}

/// An in-memory [`PageLogger`].
#[derive(Default)]
pub struct MemoryPageLogger {
    inner: RwLock<MemoryPageLoggerInner>,
}

impl MemoryPageLogger {
    /// Creates an empty page logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `timestamp` has been tombstoned.
    pub fn is_tombstoned(&self, timestamp: i64) -> bool {
        self.inner.read().tombstones.contains(&timestamp)
    }

    /// Returns the pin count of `timestamp`.
    pub fn pins(&self, timestamp: i64) -> usize {
        self.inner.read().pins.get(&timestamp).copied().unwrap_or(0)
    }
}

impl PageLogger for MemoryPageLogger {
    fn acquire(&self, timestamp: i64) {
        *self.inner.write().pins.entry(timestamp).or_insert(0) += 1;
    }

    fn release(&self, timestamp: i64) {
        let mut inner = self.inner.write();
        if let Some(count) = inner.pins.get_mut(&timestamp) {
            *count -= 1;
            if *count == 0 {
                inner.pins.remove(&timestamp);
            }
        }
    }

    fn tombstone(&self, timestamp: i64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.tombstones.insert(timestamp);
        for versions in inner.pages.values_mut() {
            versions.remove(&timestamp);
        }
        Ok(())
    }

    fn write(&self, page_number: u64, timestamp: i64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        // A tombstoned timestamp may be reused by a retried checkpoint.
        inner.tombstones.remove(&timestamp);
        inner.pages.entry(page_number).or_default().insert(timestamp, data.to_vec());
        Ok(())
    }

    fn read(&self, page_number: u64, timestamp: i64) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        inner
            .pages
            .get(&page_number)?
            .range(..=timestamp)
            .rev()
            .find(|(ts, _)| !inner.tombstones.contains(ts))
            .map(|(_, data)| data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_at_timestamp() {
        let logger = MemoryPageLogger::new();
        logger.write(1, 10, b"v10").unwrap();
        logger.write(1, 20, b"v20").unwrap();

        assert_eq!(logger.read(1, 5), None);
        assert_eq!(logger.read(1, 15), Some(b"v10".to_vec()));
        assert_eq!(logger.read(1, 25), Some(b"v20".to_vec()));
    }

    #[test]
    fn test_tombstone_hides_entries() {
        let logger = MemoryPageLogger::new();
        logger.write(1, 10, b"v10").unwrap();
        logger.write(1, 20, b"v20").unwrap();

        logger.tombstone(20).unwrap();
        assert!(logger.is_tombstoned(20));
        assert_eq!(logger.read(1, 25), Some(b"v10".to_vec()));
    }

    #[test]
    fn test_pins() {
        let logger = MemoryPageLogger::new();
        logger.acquire(5);
        logger.acquire(5);
        assert_eq!(logger.pins(5), 2);
        logger.release(5);
        logger.release(5);
        assert_eq!(logger.pins(5), 0);
        // Releasing an unpinned timestamp is harmless.
        logger.release(5);
    }
}
