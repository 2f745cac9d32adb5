// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! SQLite WAL frame format.
//!
//! A WAL version holds the bytes of a SQLite write-ahead log:
//!
//! ```text
//! +----------------------------------------------------------+
//! | Header (32 bytes)                                        |
//! |   magic | version | page_size | ckpt_seq | salt1 | salt2 |
//! |   checksum1 | checksum2                  (all u32 BE)    |
//! +----------------------------------------------------------+
//! | Frame header (24 bytes)                                  |
//! |   page_number | db_size | salt1 | salt2 | cksum1 | cksum2|
//! | Page data (page_size bytes)                              |
//! +----------------------------------------------------------+
//! | ...                                                      |
//! ```
//!
//! A frame with a non-zero `db_size` commits a transaction. Checksums are
//! cumulative over the header and every preceding frame; the scan stops at
//! the first frame whose salt or checksum does not match.

use std::collections::BTreeMap;

use super::segment::DatabaseWal;
use crate::error::{Result, StorageError};

/// Size of the WAL header.
pub const WAL_HEADER_SIZE: usize = 32;

/// Size of a frame header.
pub const WAL_FRAME_HEADER_SIZE: usize = 24;

const MAGIC_LITTLE_ENDIAN: u32 = 0x377f_0682;
const MAGIC_BIG_ENDIAN: u32 = 0x377f_0683;
const FORMAT_VERSION: u32 = 3_007_000;

/// The decoded WAL header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    /// Database page size.
    pub page_size: u32,
    /// Salt values every frame must repeat.
    pub salt: (u32, u32),
    big_endian_checksum: bool,
    checksum: (u32, u32),
}

/// Result of scanning a WAL version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalScan {
    /// Page size from the header, zero for an empty WAL.
    pub page_size: u32,
    /// Latest committed image of every page, by page number.
    pub pages: BTreeMap<u64, Vec<u8>>,
    /// Database size in pages after the last commit.
    pub db_size: u32,
    /// Number of committed frames.
    pub committed_frames: usize,
    /// Offset just past the last valid frame.
    pub end_offset: u64,
    checksum: (u32, u32),
    header: Option<WalHeader>,
}

impl WalScan {
    /// Returns true if no transaction has committed.
    pub fn is_empty(&self) -> bool {
        self.committed_frames == 0
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn checksum(data: &[u8], big_endian: bool, seed: (u32, u32)) -> (u32, u32) {
    let (mut s0, mut s1) = seed;
    for chunk in data.chunks_exact(8) {
        let (x0, x1) = if big_endian {
            (read_u32(chunk, 0), read_u32(chunk, 4))
        } else {
            (
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
            )
        };
        s0 = s0.wrapping_add(x0).wrapping_add(s1);
        s1 = s1.wrapping_add(x1).wrapping_add(s0);
    }
    (s0, s1)
}

fn decode_header(raw: &[u8; WAL_HEADER_SIZE]) -> Result<WalHeader> {
    let magic = read_u32(raw, 0);
    let big_endian_checksum = match magic {
        MAGIC_BIG_ENDIAN => true,
        MAGIC_LITTLE_ENDIAN => false,
        other => {
            return Err(StorageError::Corrupt {
                what: "WAL header",
                reason: format!("bad magic {other:#x}"),
            })
        }
    };

    let page_size = read_u32(raw, 8);
    if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
        return Err(StorageError::Corrupt {
            what: "WAL header",
            reason: format!("invalid page size {page_size}"),
        });
    }

    let computed = checksum(&raw[..24], big_endian_checksum, (0, 0));
    let stored = (read_u32(raw, 24), read_u32(raw, 28));
    if computed != stored {
        return Err(StorageError::Corrupt { what: "WAL header", reason: "checksum mismatch".into() });
    }

    Ok(WalHeader {
        page_size,
        salt: (read_u32(raw, 16), read_u32(raw, 20)),
        big_endian_checksum,
        checksum: computed,
    })
}

/// Scans a WAL version and collects the pages of every committed transaction.
///
/// Frames after the last commit frame are ignored.
pub fn scan(wal: &DatabaseWal) -> Result<WalScan> {
    let size = wal.size();
    if size < WAL_HEADER_SIZE as u64 {
        return Ok(WalScan::default());
    }

    let mut raw = [0u8; WAL_HEADER_SIZE];
    if wal.read_at(&mut raw, 0)? < WAL_HEADER_SIZE {
        return Ok(WalScan::default());
    }
    let header = decode_header(&raw)?;
    let page_size = header.page_size as usize;

    let mut result = WalScan {
        page_size: header.page_size,
        end_offset: WAL_HEADER_SIZE as u64,
        checksum: header.checksum,
        header: Some(header),
        ..WalScan::default()
    };

    let mut pending: Vec<(u64, Vec<u8>)> = Vec::new();
    let mut running = header.checksum;
    let mut offset = WAL_HEADER_SIZE as u64;
    let mut frame = vec![0u8; WAL_FRAME_HEADER_SIZE + page_size];

    while offset + frame.len() as u64 <= size {
        if wal.read_at(&mut frame, offset)? < frame.len() {
            break;
        }
        let salt = (read_u32(&frame, 8), read_u32(&frame, 12));
        if salt != header.salt {
            break;
        }
        running = checksum(&frame[..8], header.big_endian_checksum, running);
        running = checksum(&frame[WAL_FRAME_HEADER_SIZE..], header.big_endian_checksum, running);
        if running != (read_u32(&frame, 16), read_u32(&frame, 20)) {
            tracing::warn!(version = wal.timestamp(), offset, "WAL frame checksum mismatch");
            break;
        }

        let page_number = u64::from(read_u32(&frame, 0));
        let db_size = read_u32(&frame, 4);
        pending.push((page_number, frame[WAL_FRAME_HEADER_SIZE..].to_vec()));
        offset += frame.len() as u64;

        if db_size != 0 {
            result.committed_frames += pending.len();
            result.pages.extend(pending.drain(..));
            result.db_size = db_size;
            result.end_offset = offset;
            result.checksum = running;
        }
    }

    Ok(result)
}

/// Appends SQLite WAL frames to a WAL version.
#[derive(Debug)]
pub struct FrameWriter {
    header: WalHeader,
    checksum: (u32, u32),
    offset: u64,
}

impl FrameWriter {
    /// Opens a writer positioned after the last committed frame.
    ///
    /// An empty WAL gets a fresh header with `page_size`, salted with the
    /// version's timestamp.
    pub fn open(wal: &DatabaseWal, page_size: u32) -> Result<Self> {
        let existing = scan(wal)?;
        if let Some(header) = existing.header {
            return Ok(Self { header, checksum: existing.checksum, offset: existing.end_offset });
        }

        let timestamp = wal.timestamp();
        let mut raw = [0u8; WAL_HEADER_SIZE];
        raw[0..4].copy_from_slice(&MAGIC_BIG_ENDIAN.to_be_bytes());
        raw[4..8].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        raw[8..12].copy_from_slice(&page_size.to_be_bytes());
        raw[16..20].copy_from_slice(&((timestamp >> 32) as u32).to_be_bytes());
        raw[20..24].copy_from_slice(&(timestamp as u32).to_be_bytes());
        let sum = checksum(&raw[..24], true, (0, 0));
        raw[24..28].copy_from_slice(&sum.0.to_be_bytes());
        raw[28..32].copy_from_slice(&sum.1.to_be_bytes());

        let header = decode_header(&raw)?;
        wal.write_at(&raw, 0)?;
        Ok(Self { header, checksum: sum, offset: WAL_HEADER_SIZE as u64 })
    }

    /// Page size frames must carry.
    pub fn page_size(&self) -> u32 {
        self.header.page_size
    }

    /// Appends one frame. A non-zero `db_size` commits the transaction.
    pub fn append(
        &mut self,
        wal: &DatabaseWal,
        page_number: u32,
        data: &[u8],
        db_size: u32,
    ) -> Result<()> {
        if data.len() != self.header.page_size as usize {
            return Err(StorageError::Corrupt {
                what: "WAL frame",
                reason: format!("expected {} bytes, got {}", self.header.page_size, data.len()),
            });
        }
        if page_number == 0 {
            return Err(StorageError::InvalidPage(0));
        }

        let mut frame = Vec::with_capacity(WAL_FRAME_HEADER_SIZE + data.len());
        frame.extend_from_slice(&page_number.to_be_bytes());
        frame.extend_from_slice(&db_size.to_be_bytes());
        frame.extend_from_slice(&self.header.salt.0.to_be_bytes());
        frame.extend_from_slice(&self.header.salt.1.to_be_bytes());

        let big_endian = self.header.big_endian_checksum;
        let sum = checksum(data, big_endian, checksum(&frame[..8], big_endian, self.checksum));
        frame.extend_from_slice(&sum.0.to_be_bytes());
        frame.extend_from_slice(&sum.1.to_be_bytes());
        frame.extend_from_slice(data);

        wal.write_at(&frame, self.offset)?;
        self.offset += frame.len() as u64;
        self.checksum = sum;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use basalt_core::{BranchKey, FixedRole};
    use tempfile::TempDir;

    use super::*;
    use crate::fs::{FileSystem, LocalFileSystem};
    use crate::wal::segment::{wal_directory, WalOptions};

    const PAGE: usize = 512;

    fn open_wal(dir: &TempDir) -> DatabaseWal {
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()).unwrap());
        let branch = BranchKey::new("db", "main");
        fs.mkdir_all(&wal_directory(&branch)).unwrap();
        DatabaseWal::open(&fs, &branch, 1_700_000_000_123, Arc::new(FixedRole::primary()), WalOptions::default())
            .unwrap()
    }

    #[test]
    fn test_empty_wal_scans_empty() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);
        let result = scan(&wal).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.page_size, 0);
    }

    #[test]
    fn test_only_committed_frames_are_returned() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);
        let mut writer = FrameWriter::open(&wal, PAGE as u32).unwrap();

        writer.append(&wal, 1, &[1u8; PAGE], 0).unwrap();
        writer.append(&wal, 2, &[2u8; PAGE], 2).unwrap();
        // Second transaction rewrites page 1 and commits.
        writer.append(&wal, 1, &[3u8; PAGE], 2).unwrap();
        // Third transaction never commits.
        writer.append(&wal, 3, &[4u8; PAGE], 0).unwrap();

        let result = scan(&wal).unwrap();
        assert_eq!(result.page_size, PAGE as u32);
        assert_eq!(result.committed_frames, 3);
        assert_eq!(result.db_size, 2);
        assert_eq!(result.pages.len(), 2);
        assert_eq!(result.pages[&1], vec![3u8; PAGE]);
        assert_eq!(result.pages[&2], vec![2u8; PAGE]);
    }

    #[test]
    fn test_writer_resumes_after_last_commit() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);
        {
            let mut writer = FrameWriter::open(&wal, PAGE as u32).unwrap();
            writer.append(&wal, 1, &[1u8; PAGE], 1).unwrap();
        }

        let mut writer = FrameWriter::open(&wal, PAGE as u32).unwrap();
        writer.append(&wal, 2, &[2u8; PAGE], 2).unwrap();

        let result = scan(&wal).unwrap();
        assert_eq!(result.committed_frames, 2);
        assert_eq!(result.db_size, 2);
    }

    #[test]
    fn test_corrupt_frame_ends_scan() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);
        let mut writer = FrameWriter::open(&wal, PAGE as u32).unwrap();
        writer.append(&wal, 1, &[1u8; PAGE], 1).unwrap();
        writer.append(&wal, 2, &[2u8; PAGE], 2).unwrap();

        // Flip a byte in the second frame's page data.
        let second = (WAL_HEADER_SIZE + WAL_FRAME_HEADER_SIZE + PAGE + WAL_FRAME_HEADER_SIZE) as u64;
        wal.write_at(&[9u8], second + 10).unwrap();

        let result = scan(&wal).unwrap();
        assert_eq!(result.committed_frames, 1);
        assert_eq!(result.db_size, 1);
    }

    #[test]
    fn test_rejects_bad_header() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);
        wal.write_at(&[0xAB; WAL_HEADER_SIZE], 0).unwrap();
        assert!(matches!(scan(&wal), Err(StorageError::Corrupt { .. })));
    }

    #[test]
    fn test_rejects_wrong_page_size() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);
        let mut writer = FrameWriter::open(&wal, PAGE as u32).unwrap();
        assert!(writer.append(&wal, 1, &[0u8; 100], 1).is_err());
        assert!(writer.append(&wal, 0, &[0u8; PAGE], 1).is_err());
    }
}
