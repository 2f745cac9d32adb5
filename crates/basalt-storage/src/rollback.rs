// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Rollback log holding pre-checkpoint page images.
//!
//! Each checkpoint writes one frame to `<branch-dir>/logs/ROLLBACK`:
//!
//! ```text
//! FrameBegin { timestamp, page_count }
//! Page { page_number, data }*        (first before-image of each page only)
//! FrameCommit { timestamp }
//! ```
//!
//! Every record is stored as `len (u32 LE) | crc32c (u32 LE) | bincode payload`.
//! A torn or corrupt tail ends the read without error, so a crash while
//! appending never prevents a rollback of the frame's intact prefix.
//!
//! Appends are synced before returning: a before-image must be durable
//! before the page store overwrites the page it describes.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use basalt_core::BranchKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::fs::{FileSystem, OpenMode};

/// Size of the per-record header (length + checksum).
const RECORD_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum RollbackRecord {
    FrameBegin { timestamp: i64, page_count: u64 },
    Page { timestamp: i64, page_number: u64, data: Vec<u8> },
    FrameCommit { timestamp: i64 },
}

/// The contents of one rollback frame, as read back from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackFrame {
    /// Checkpoint timestamp the frame belongs to.
    pub timestamp: i64,
    /// Page count when the frame began.
    pub page_count: u64,
    /// Before-images of every page the checkpoint overwrote, in log order.
    pub pages: Vec<(u64, Vec<u8>)>,
    /// Whether the frame was committed.
    pub committed: bool,
}

struct RollbackInner {
    file: File,
    end: u64,
    /// Offset up to which the log is known to be on stable storage.
    synced: u64,
    /// Page numbers already logged in the open frame.
    logged: HashSet<u64>,
}

/// Append-only rollback log for one branch.
pub struct RollbackLog {
    inner: Mutex<RollbackInner>,
}

impl RollbackLog {
    /// Opens (or creates) the rollback log of a branch.
    pub fn open(fs: &Arc<dyn FileSystem>, branch: &BranchKey) -> Result<Self> {
        let logs = branch.logs_directory();
        fs.mkdir_all(&logs)?;
        let file = fs.open_file(&logs.join("ROLLBACK"), OpenMode::ReadWrite)?;
        let end = file.metadata()?.len();
        Ok(Self {
            inner: Mutex::new(RollbackInner { file, end, synced: end, logged: HashSet::new() }),
        })
    }

    /// Re-reads the end of the log, picking up frames appended by another
    /// process since it was opened.
    pub fn reload(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let end = inner.file.metadata()?.len();
        inner.end = end;
        inner.synced = end;
        inner.logged.clear();
        Ok(())
    }

    /// Returns the current end offset of the log.
    pub fn len(&self) -> u64 {
        self.inner.lock().end
    }

    /// Returns the offset up to which the log has been synced.
    pub fn synced_len(&self) -> u64 {
        self.inner.lock().synced
    }

    /// Returns true if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts a new frame and returns its offset.
    pub fn begin_frame(&self, timestamp: i64, page_count: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let offset = inner.end;
        inner.logged.clear();
        Self::append_locked(&mut inner, &RollbackRecord::FrameBegin { timestamp, page_count })?;
        Self::sync_locked(&mut inner)?;
        Ok(offset)
    }

    /// Records the before-image of a page, once per frame.
    ///
    /// Returns false if the page was already logged in this frame.
    pub fn append_page(&self, timestamp: i64, page_number: u64, data: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.logged.insert(page_number) {
            return Ok(false);
        }
        let record = RollbackRecord::Page { timestamp, page_number, data: data.to_vec() };
        let appended = Self::append_locked(&mut inner, &record);
        if let Err(e) = appended.and_then(|()| Self::sync_locked(&mut inner)) {
            inner.logged.remove(&page_number);
            return Err(e);
        }
        Ok(true)
    }

    /// Seals the open frame and syncs the log. Returns the frame size in bytes.
    pub fn commit_frame(&self, timestamp: i64, offset: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        Self::append_locked(&mut inner, &RollbackRecord::FrameCommit { timestamp })?;
        Self::sync_locked(&mut inner)?;
        inner.logged.clear();
        Ok(inner.end.saturating_sub(offset))
    }

    /// Reads the frame starting at `offset`.
    pub fn read_frame(&self, offset: u64) -> Result<RollbackFrame> {
        let mut inner = self.inner.lock();
        let end = inner.end;
        if offset >= end {
            return Ok(RollbackFrame::default());
        }

        let mut raw = vec![0u8; (end - offset) as usize];
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(&mut raw)?;
        drop(inner);

        let mut frame = RollbackFrame::default();
        let mut seen = HashSet::new();
        let mut cursor = 0usize;
        let mut started = false;

        while let Some((record, consumed)) = decode_record(&raw[cursor..]) {
            cursor += consumed;
            match record {
                RollbackRecord::FrameBegin { timestamp, page_count } => {
                    if started {
                        // A second frame follows this one.
                        break;
                    }
                    started = true;
                    frame.timestamp = timestamp;
                    frame.page_count = page_count;
                }
                RollbackRecord::Page { timestamp, page_number, data } => {
                    if started && timestamp == frame.timestamp && seen.insert(page_number) {
                        frame.pages.push((page_number, data));
                    }
                }
                RollbackRecord::FrameCommit { timestamp } => {
                    if started && timestamp == frame.timestamp {
                        frame.committed = true;
                        break;
                    }
                }
            }
        }

        if !started {
            return Err(StorageError::Corrupt {
                what: "rollback log",
                reason: format!("no frame begins at offset {offset}"),
            });
        }
        Ok(frame)
    }

    /// Drops everything from `offset` to the end of the log.
    pub fn discard_from(&self, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if offset < inner.end {
            inner.file.set_len(offset)?;
            inner.file.sync_all()?;
            inner.end = offset;
            inner.synced = inner.synced.min(offset);
        }
        inner.logged.clear();
        Ok(())
    }

    fn sync_locked(inner: &mut RollbackInner) -> Result<()> {
        inner.file.sync_data()?;
        inner.synced = inner.end;
        Ok(())
    }

    fn append_locked(inner: &mut RollbackInner, record: &RollbackRecord) -> Result<()> {
        let payload = bincode::serialize(record)?;
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);

        let end = inner.end;
        inner.file.seek(SeekFrom::Start(end))?;
        inner.file.write_all(&buf)?;
        inner.end = end + buf.len() as u64;
        Ok(())
    }
}

/// Decodes one record, returning `None` for a torn or corrupt record.
fn decode_record(raw: &[u8]) -> Option<(RollbackRecord, usize)> {
    if raw.len() < RECORD_HEADER_SIZE {
        return None;
    }
    let len = u32::from_le_bytes(raw[0..4].try_into().ok()?) as usize;
    let crc = u32::from_le_bytes(raw[4..8].try_into().ok()?);
    let payload = raw.get(RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len)?;
    if crc32c::crc32c(payload) != crc {
        tracing::warn!(len, "Rollback log record failed checksum, treating as torn tail");
        return None;
    }
    let record = bincode::deserialize(payload).ok()?;
    Some((record, RECORD_HEADER_SIZE + len))
}
