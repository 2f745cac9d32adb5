// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! On-disk checkpoint marker.
//!
//! While a checkpoint is open, `<branch-dir>/logs/CHECKPOINT` holds a fixed
//! 48-byte record of little-endian `u64`s:
//!
//! ```text
//! version (=1) | begin_page_count | largest_page_number | offset | size | timestamp
//! ```
//!
//! Finding the marker at startup means the previous process died between
//! begin and commit.

use std::path::PathBuf;

use basalt_core::BranchKey;

use crate::error::{Result, StorageError};

/// Encoded size of a marker.
pub const MARKER_SIZE: usize = 48;

const MARKER_VERSION: u64 = 1;

/// Returns the relative path of a branch's checkpoint marker.
#[must_use]
pub fn marker_path(branch: &BranchKey) -> PathBuf {
    branch.logs_directory().join("CHECKPOINT")
}

/// One in-flight checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// Page count when the checkpoint began.
    pub begin_page_count: u64,
    /// Highest page number written by the checkpoint so far.
    pub largest_page_number: u64,
    /// Offset of the checkpoint's frame in the rollback log.
    pub offset: u64,
    /// Size of the rollback frame in bytes, known once committed.
    pub size: u64,
    /// WAL version being checkpointed.
    pub timestamp: i64,
}

impl Checkpoint {
    /// Encodes the marker record.
    #[must_use]
    pub fn encode(&self) -> [u8; MARKER_SIZE] {
        let fields = [
            MARKER_VERSION,
            self.begin_page_count,
            self.largest_page_number,
            self.offset,
            self.size,
            self.timestamp as u64,
        ];
        let mut buf = [0u8; MARKER_SIZE];
        for (chunk, field) in buf.chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        buf
    }

    /// Decodes a marker record.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() != MARKER_SIZE {
            return Err(StorageError::Corrupt {
                what: "checkpoint marker",
                reason: format!("expected {MARKER_SIZE} bytes, got {}", raw.len()),
            });
        }

        let mut fields = [0u64; 6];
        for (field, chunk) in fields.iter_mut().zip(raw.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *field = u64::from_le_bytes(bytes);
        }

        if fields[0] != MARKER_VERSION {
            return Err(StorageError::Corrupt {
                what: "checkpoint marker",
                reason: format!("unsupported version {}", fields[0]),
            });
        }

        Ok(Self {
            begin_page_count: fields[1],
            largest_page_number: fields[2],
            offset: fields[3],
            size: fields[4],
            timestamp: fields[5] as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let checkpoint = Checkpoint {
            begin_page_count: 7,
            largest_page_number: 9,
            offset: 4096,
            size: 128,
            timestamp: 1_700_000_000_000_000_000,
        };
        let raw = checkpoint.encode();

        assert_eq!(&raw[0..8], &1u64.to_le_bytes());
        assert_eq!(&raw[8..16], &7u64.to_le_bytes());
        assert_eq!(&raw[24..32], &4096u64.to_le_bytes());
        assert_eq!(Checkpoint::decode(&raw).unwrap(), checkpoint);
    }

    #[test]
    fn test_rejects_bad_records() {
        assert!(Checkpoint::decode(&[0u8; 47]).is_err());

        let mut raw = Checkpoint::default().encode();
        raw[0] = 2;
        assert!(matches!(Checkpoint::decode(&raw), Err(StorageError::Corrupt { .. })));
    }
}
