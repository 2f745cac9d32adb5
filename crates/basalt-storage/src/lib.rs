// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Storage layer for Basalt.
//!
//! This crate provides:
//! - Versioned WAL segments with an LFU cache and a per-branch manager
//! - Crash-safe checkpointing into a durable page store
//! - Rollback and snapshot logs backing checkpoint recovery and branching
//! - Write and checkpoint coordination across branches

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoint;
pub mod connection;
pub mod error;
pub mod fs;
pub mod metrics;
pub mod page_logger;
pub mod page_store;
pub mod rollback;
pub mod snapshot;
pub mod wal;

pub use checkpoint::{Checkpoint, Checkpointer};
pub use connection::{BranchResources, CheckpointSummary, ConnectionManager};
pub use error::{Result, StorageError};
pub use fs::{FileSystem, LocalFileSystem, OpenMode};
pub use page_logger::{MemoryPageLogger, PageLogger};
pub use page_store::{PageStore, PageStoreMetadata};
pub use snapshot::{Snapshot, SnapshotLog};
pub use wal::{DatabaseWal, DatabaseWalManager, FrameWriter, GcStats, WalOptions};
