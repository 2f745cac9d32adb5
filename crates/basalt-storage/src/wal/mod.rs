// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Versioned write-ahead log.
//!
//! Each branch writes its SQLite WAL into a sequence of immutable versions,
//! one file per version at `<branch-dir>/logs/wal/WAL_<timestamp>`.
//!
//! # How It Works
//!
//! 1. A writer acquires the current version from the [`DatabaseWalManager`]
//!    and appends frames to it inside the checkpoint barrier.
//! 2. A checkpoint copies the committed pages of the current version into
//!    the page store, then freezes the version and rotates to a new one.
//! 3. Garbage collection deletes frozen versions once no local reader and no
//!    replica still references them.
//!
//! # Example
//!
//! ```ignore
//! use basalt_storage::wal::{DatabaseWalManager, FrameWriter, WalOptions};
//!
//! let manager = DatabaseWalManager::open(fs, branch, role, survey, WalOptions::default())?;
//!
//! let version = manager.acquire()?;
//! manager.checkpoint_barrier(|| {
//!     let wal = manager.get(version)?;
//!     let mut writer = FrameWriter::open(&wal, 4096)?;
//!     writer.append(&wal, 1, &page, 1)
//! })?;
//! manager.release(version);
//! ```

mod cache;
mod frames;
mod manager;
mod segment;

pub use cache::LfuCache;
pub use frames::{scan, FrameWriter, WalHeader, WalScan, WAL_FRAME_HEADER_SIZE, WAL_HEADER_SIZE};
pub use manager::{DatabaseWalManager, GcStats};
pub use segment::{parse_wal_file_name, wal_directory, wal_path, DatabaseWal, WalOptions};
