// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Moves WAL pages into the page store with crash recovery.
//!
//! A checkpoint runs `begin -> checkpoint_page* -> commit | rollback`:
//!
//! 1. `begin` opens a rollback frame and persists the checkpoint marker.
//! 2. `checkpoint_page` saves the page's previous image to the rollback log,
//!    then writes the new image to the page store and the page logger.
//! 3. `commit` seals the rollback frame, raises the page count and records a
//!    snapshot, then deletes the marker.
//! 4. `rollback` restores the previous images, tombstones the checkpoint in
//!    the page logger, resets the page count and deletes the marker.
//!
//! A marker with no open checkpoint behind it means a process crashed
//! mid-checkpoint. Only the primary repairs that: at open, or before its
//! first checkpoint after a promotion. Other nodes share the page store and
//! logs with the primary and never touch them, since the marker they see
//! usually belongs to a checkpoint the primary is still running.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use basalt_core::{BranchKey, NodeRole};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::marker::{marker_path, Checkpoint};
use crate::error::{Result, StorageError};
use crate::fs::FileSystem;
use crate::metrics;
use crate::page_logger::PageLogger;
use crate::page_store::PageStore;
use crate::rollback::RollbackLog;
use crate::snapshot::{Snapshot, SnapshotLog};

struct ActiveCheckpoint {
    checkpoint: Checkpoint,
    started: Instant,
    pages_written: u64,
}

/// Checkpoint state, guarded by the checkpointer's lock.
pub struct CheckpointState {
    active: Option<ActiveCheckpoint>,
}

impl CheckpointState {
    /// Returns the open checkpoint, if any.
    pub fn in_progress(&self) -> Option<Checkpoint> {
        self.active.as_ref().map(|a| a.checkpoint)
    }
}

/// Checkpoints one branch.
pub struct Checkpointer {
    fs: Arc<dyn FileSystem>,
    branch: BranchKey,
    page_store: Arc<PageStore>,
    page_logger: Arc<dyn PageLogger>,
    role: Arc<dyn NodeRole>,
    rollback_log: RollbackLog,
    snapshots: SnapshotLog,
    marker_path: PathBuf,
    state: Mutex<CheckpointState>,
}

impl Checkpointer {
    /// Opens the checkpointer.
    ///
    /// On the primary, a checkpoint left open by a crash is rolled back.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        branch: BranchKey,
        page_store: Arc<PageStore>,
        page_logger: Arc<dyn PageLogger>,
        role: Arc<dyn NodeRole>,
    ) -> Result<Self> {
        let rollback_log = RollbackLog::open(&fs, &branch)?;
        let snapshots = SnapshotLog::open(&fs, &branch)?;
        let marker_path = marker_path(&branch);

        let checkpointer = Self {
            fs,
            branch,
            page_store,
            page_logger,
            role,
            rollback_log,
            snapshots,
            marker_path,
            state: Mutex::new(CheckpointState { active: None }),
        };

        if checkpointer.role.is_primary() {
            checkpointer.recover()?;
        } else {
            debug!(branch = %checkpointer.branch, "Not primary, deferring checkpoint recovery");
        }
        Ok(checkpointer)
    }

    /// Rolls back a checkpoint a crashed process left open.
    ///
    /// Returns true if one was found. Does nothing while this checkpointer
    /// has a checkpoint open itself.
    pub fn recover(&self) -> Result<bool> {
        let mut state = self.state.lock();
        self.recover_locked(&mut state)
    }

    fn recover_locked(&self, state: &mut CheckpointState) -> Result<bool> {
        if state.active.is_some() {
            return Ok(false);
        }

        // Another process may have checkpointed since these were loaded.
        self.page_store.reload()?;
        self.rollback_log.reload()?;

        if !self.fs.exists(&self.marker_path)? {
            return Ok(false);
        }

        let raw = self.fs.read_file(&self.marker_path)?;
        let checkpoint = Checkpoint::decode(&raw)?;
        warn!(
            branch = %self.branch,
            timestamp = checkpoint.timestamp,
            begin_page_count = checkpoint.begin_page_count,
            "Found incomplete checkpoint, rolling back"
        );

        self.page_logger.acquire(checkpoint.timestamp);
        state.active = Some(ActiveCheckpoint { checkpoint, started: Instant::now(), pages_written: 0 });
        self.rollback_locked(state)?;
        Ok(true)
    }

    /// Branch this checkpointer serves.
    pub fn branch(&self) -> &BranchKey {
        &self.branch
    }

    /// The page store checkpoints write to.
    pub fn page_store(&self) -> &Arc<PageStore> {
        &self.page_store
    }

    /// Returns the open checkpoint, if any.
    pub fn in_progress(&self) -> Option<Checkpoint> {
        self.state.lock().in_progress()
    }

    /// Returns the latest snapshot at or before `timestamp`.
    pub fn snapshot_at(&self, timestamp: i64) -> Result<Option<Snapshot>> {
        self.snapshots.snapshot_at(timestamp)
    }

    /// Runs `f` while holding the checkpoint lock.
    ///
    /// No checkpoint can begin, progress or finish while `f` runs. `f` must
    /// not call back into the checkpointer.
    pub fn with_lock<T>(&self, f: impl FnOnce(&CheckpointState) -> T) -> T {
        let state = self.state.lock();
        f(&state)
    }

    /// Opens a checkpoint of WAL version `timestamp`.
    ///
    /// Only the primary may checkpoint.
    pub fn begin(&self, timestamp: i64) -> Result<()> {
        if !self.role.is_primary() {
            return Err(StorageError::CheckpointOnReplica);
        }

        let mut state = self.state.lock();
        if let Some(active) = &state.active {
            return Err(StorageError::CheckpointAlreadyInProgress {
                timestamp: active.checkpoint.timestamp,
            });
        }
        self.recover_locked(&mut state)?;

        let begin_page_count = self.page_store.page_count();
        let offset = self.rollback_log.begin_frame(timestamp, begin_page_count)?;
        let checkpoint = Checkpoint {
            begin_page_count,
            largest_page_number: 0,
            offset,
            size: 0,
            timestamp,
        };

        if let Err(e) = self.fs.write_file(&self.marker_path, &checkpoint.encode()) {
            self.rollback_log.discard_from(offset)?;
            return Err(e.into());
        }

        self.page_logger.acquire(timestamp);
        state.active = Some(ActiveCheckpoint { checkpoint, started: Instant::now(), pages_written: 0 });
        debug!(branch = %self.branch, timestamp, begin_page_count, "Checkpoint started");
        Ok(())
    }

    /// Writes one page as part of the open checkpoint.
    pub fn checkpoint_page(&self, page_number: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let active = state.active.as_mut().ok_or(StorageError::NoCheckpointInProgress)?;
        let checkpoint = &mut active.checkpoint;

        if page_number <= checkpoint.begin_page_count {
            if let Some(before) = self.page_store.read_page(page_number)? {
                self.rollback_log.append_page(checkpoint.timestamp, page_number, &before)?;
            }
        }

        self.page_store.write_page(page_number, data)?;
        self.page_logger.write(page_number, checkpoint.timestamp, data)?;

        checkpoint.largest_page_number = checkpoint.largest_page_number.max(page_number);
        active.pages_written += 1;
        Ok(())
    }

    /// Makes the open checkpoint durable.
    ///
    /// Sealing the rollback frame, updating the page count and recording the
    /// snapshot run concurrently. If any of them fails the errors are
    /// returned together and the checkpoint stays open, marker included, so
    /// the caller can roll it back.
    pub fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        let active = state.active.as_mut().ok_or(StorageError::NoCheckpointInProgress)?;
        let checkpoint = active.checkpoint;

        self.page_store.sync()?;

        let final_page_count = checkpoint.begin_page_count.max(checkpoint.largest_page_number);
        let (sealed, counted, recorded) = std::thread::scope(|scope| {
            let sealed = scope
                .spawn(|| self.rollback_log.commit_frame(checkpoint.timestamp, checkpoint.offset));
            let counted = scope.spawn(|| {
                if checkpoint.largest_page_number > self.page_store.page_count() {
                    self.page_store.set_page_count(checkpoint.largest_page_number)
                } else {
                    Ok(())
                }
            });
            let recorded = scope.spawn(|| {
                self.snapshots.record(Snapshot {
                    timestamp: checkpoint.timestamp,
                    page_count: final_page_count,
                })
            });
            (join(sealed.join()), join(counted.join()), join(recorded.join()))
        });

        let mut errors = Vec::new();
        let size = match sealed {
            Ok(size) => size,
            Err(e) => {
                errors.push(e);
                0
            }
        };
        errors.extend(counted.err());
        errors.extend(recorded.err());
        if !errors.is_empty() {
            error!(
                branch = %self.branch,
                timestamp = checkpoint.timestamp,
                failures = errors.len(),
                "Checkpoint commit failed"
            );
            metrics::record_checkpoint("failed");
            return Err(StorageError::Aggregate { operation: "checkpoint commit", errors });
        }
        active.checkpoint.size = size;

        self.fs.remove(&self.marker_path)?;

        let pages = active.pages_written;
        let seconds = active.started.elapsed().as_secs_f64();
        state.active = None;
        self.page_logger.release(checkpoint.timestamp);

        metrics::record_checkpoint("committed");
        metrics::record_checkpoint_commit(pages, seconds);
        debug!(
            branch = %self.branch,
            timestamp = checkpoint.timestamp,
            pages,
            page_count = final_page_count,
            rollback_bytes = size,
            "Checkpoint committed"
        );
        Ok(())
    }

    /// Undoes the open checkpoint.
    pub fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.rollback_locked(&mut state)
    }

    fn rollback_locked(&self, state: &mut CheckpointState) -> Result<()> {
        let checkpoint =
            state.active.as_ref().ok_or(StorageError::NoCheckpointInProgress)?.checkpoint;

        let frame = self.rollback_log.read_frame(checkpoint.offset)?;
        if frame.timestamp != 0 && frame.timestamp != checkpoint.timestamp {
            return Err(StorageError::Corrupt {
                what: "rollback log",
                reason: format!(
                    "frame at {} belongs to {}, expected {}",
                    checkpoint.offset, frame.timestamp, checkpoint.timestamp
                ),
            });
        }

        let mut restored = 0;
        for (page_number, data) in &frame.pages {
            if *page_number <= checkpoint.begin_page_count {
                self.page_store.write_page(*page_number, data)?;
                restored += 1;
            }
        }

        self.page_logger.tombstone(checkpoint.timestamp)?;
        self.page_store.truncate(checkpoint.begin_page_count)?;
        self.page_store.sync()?;
        let snapshots = self.snapshots.discard_from(checkpoint.timestamp)?;
        self.fs.remove(&self.marker_path)?;
        self.rollback_log.discard_from(checkpoint.offset)?;

        state.active = None;
        self.page_logger.release(checkpoint.timestamp);
        metrics::record_checkpoint("rolled_back");
        info!(
            branch = %self.branch,
            timestamp = checkpoint.timestamp,
            restored,
            snapshots,
            page_count = checkpoint.begin_page_count,
            "Checkpoint rolled back"
        );
        Ok(())
    }
}

fn join<T>(result: std::thread::Result<Result<T>>) -> Result<T> {
    result.unwrap_or_else(|_| Err(StorageError::Task("checkpoint commit step panicked".into())))
}
