// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! WAL version management for one branch.
//!
//! The manager owns every [`DatabaseWal`] of a branch, keyed by version.
//! The current writable version is always the highest version that has not
//! been checkpointed. Callers reference-count the versions they read or
//! write with [`acquire`]/[`release`]; garbage collection never deletes a
//! version that is referenced locally or reported in use by a replica.
//!
//! Lock order is `usage` before `versions`. Neither lock is held across
//! file-system deletes or the replica survey.
//!
//! [`acquire`]: DatabaseWalManager::acquire
//! [`release`]: DatabaseWalManager::release

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use basalt_core::{unix_nanos, BranchKey, NodeRole, ReplicaWalSurvey};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::segment::{parse_wal_file_name, wal_directory, wal_path, DatabaseWal, WalOptions};
use crate::error::{Result, StorageError};
use crate::fs::FileSystem;
use crate::metrics;

/// Outcome of one garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Versions strictly older than this were eligible, if any constraint existed.
    pub bound: Option<i64>,
    /// Versions that were deleted.
    pub removed: Vec<i64>,
    /// True if the run was skipped because a replica did not answer.
    pub skipped: bool,
}

/// Resets the manager's checkpointing flag when a checkpoint ends.
struct CheckpointingGuard<'a>(&'a Mutex<bool>);

impl Drop for CheckpointingGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = false;
    }
}

/// Owns the WAL versions of one branch.
pub struct DatabaseWalManager {
    fs: Arc<dyn FileSystem>,
    branch: BranchKey,
    role: Arc<dyn NodeRole>,
    survey: Arc<dyn ReplicaWalSurvey>,
    options: WalOptions,
    versions: RwLock<BTreeMap<i64, Arc<DatabaseWal>>>,
    usage: Mutex<HashMap<i64, usize>>,
    checkpointing: Mutex<bool>,
    barrier: Mutex<()>,
    last_checkpointed_version: AtomicI64,
}

impl DatabaseWalManager {
    /// Opens the manager, loading existing WAL versions from disk.
    ///
    /// Every version except the newest is treated as checkpointed: a version
    /// is only superseded after its checkpoint committed.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        branch: BranchKey,
        role: Arc<dyn NodeRole>,
        survey: Arc<dyn ReplicaWalSurvey>,
        options: WalOptions,
    ) -> Result<Self> {
        let manager = Self {
            fs,
            branch,
            role,
            survey,
            options,
            versions: RwLock::new(BTreeMap::new()),
            usage: Mutex::new(HashMap::new()),
            checkpointing: Mutex::new(false),
            barrier: Mutex::new(()),
            last_checkpointed_version: AtomicI64::new(0),
        };

        manager.refresh()?;

        info!(
            branch = %manager.branch,
            versions = manager.versions.read().len(),
            "WAL manager opened"
        );
        Ok(manager)
    }

    /// Branch this manager serves.
    pub fn branch(&self) -> &BranchKey {
        &self.branch
    }

    /// Reconciles the in-memory version index with the files on disk.
    ///
    /// Picks up versions created elsewhere (replicas following the primary)
    /// and forgets unreferenced versions whose files were collected.
    pub fn refresh(&self) -> Result<()> {
        let names = self.fs.read_dir(&wal_directory(&self.branch))?;
        let on_disk: Vec<i64> = names.iter().filter_map(|n| parse_wal_file_name(n)).collect();

        let usage = self.usage.lock();
        let mut versions = self.versions.write();

        for &timestamp in &on_disk {
            if !versions.contains_key(&timestamp) {
                let wal = DatabaseWal::open(
                    &self.fs,
                    &self.branch,
                    timestamp,
                    Arc::clone(&self.role),
                    self.options,
                )?;
                versions.insert(timestamp, Arc::new(wal));
            }
        }

        versions.retain(|timestamp, _| {
            on_disk.contains(timestamp) || usage.get(timestamp).copied().unwrap_or(0) > 0
        });

        let newest = versions.keys().next_back().copied();
        for (&timestamp, wal) in versions.iter() {
            if Some(timestamp) != newest && !wal.is_checkpointed() {
                wal.mark_checkpointed();
                self.last_checkpointed_version.fetch_max(timestamp, Ordering::SeqCst);
            }
        }

        metrics::record_wal_versions(&self.branch, versions.len());
        Ok(())
    }

    /// Creates a new WAL version. Only the primary may create versions.
    pub fn create(&self) -> Result<Arc<DatabaseWal>> {
        if !self.role.is_primary() {
            return Err(StorageError::CreateWalVersionOnReplica);
        }
        let mut versions = self.versions.write();
        self.create_locked(&mut versions)
    }

    fn create_locked(
        &self,
        versions: &mut BTreeMap<i64, Arc<DatabaseWal>>,
    ) -> Result<Arc<DatabaseWal>> {
        if !self.role.is_primary() {
            return Err(StorageError::CreateWalVersionOnReplica);
        }
        self.fs.mkdir_all(&wal_directory(&self.branch))?;

        let newest = versions.keys().next_back().copied().unwrap_or(0);
        let mut timestamp = unix_nanos().max(newest + 1);
        while versions.contains_key(&timestamp)
            || self.fs.exists(&wal_path(&self.branch, timestamp))?
        {
            timestamp += 1;
        }

        let wal = Arc::new(DatabaseWal::open(
            &self.fs,
            &self.branch,
            timestamp,
            Arc::clone(&self.role),
            self.options,
        )?);
        versions.insert(timestamp, Arc::clone(&wal));

        metrics::record_wal_version_created();
        metrics::record_wal_versions(&self.branch, versions.len());
        debug!(branch = %self.branch, version = timestamp, "Created WAL version");
        Ok(wal)
    }

    /// Returns the current writable version, if one exists.
    pub fn current(&self) -> Option<Arc<DatabaseWal>> {
        let versions = self.versions.read();
        versions.values().next_back().filter(|wal| !wal.is_checkpointed()).cloned()
    }

    /// Returns the current writable version, creating one if the newest
    /// version has been checkpointed or none exists.
    pub fn get_or_create_current(&self) -> Result<Arc<DatabaseWal>> {
        if let Some(wal) = self.current() {
            return Ok(wal);
        }

        let mut versions = self.versions.write();
        if let Some(wal) = versions.values().next_back() {
            if !wal.is_checkpointed() {
                return Ok(Arc::clone(wal));
            }
        }
        self.create_locked(&mut versions)
    }

    /// Looks up a version.
    pub fn get(&self, timestamp: i64) -> Result<Arc<DatabaseWal>> {
        self.versions
            .read()
            .get(&timestamp)
            .cloned()
            .ok_or(StorageError::WalVersionNotFound(timestamp))
    }

    /// Returns every known version, oldest first.
    pub fn versions(&self) -> Vec<i64> {
        self.versions.read().keys().copied().collect()
    }

    /// Returns the most recently checkpointed version, if any.
    pub fn last_checkpointed_version(&self) -> Option<i64> {
        match self.last_checkpointed_version.load(Ordering::SeqCst) {
            0 => None,
            version => Some(version),
        }
    }

    /// References the current version and returns its timestamp.
    ///
    /// Every call must be paired with exactly one [`release`].
    ///
    /// [`release`]: DatabaseWalManager::release
    pub fn acquire(&self) -> Result<i64> {
        let mut usage = self.usage.lock();
        let timestamp = self.get_or_create_current()?.timestamp();
        *usage.entry(timestamp).or_insert(0) += 1;
        Ok(timestamp)
    }

    /// Drops one reference to `timestamp`.
    pub fn release(&self, timestamp: i64) {
        let mut usage = self.usage.lock();
        match usage.get_mut(&timestamp) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                usage.remove(&timestamp);
            }
            None => warn!(branch = %self.branch, version = timestamp, "Released unreferenced WAL version"),
        }
    }

    /// Returns the versions with a positive reference count, oldest first.
    pub fn in_use_versions(&self) -> Vec<i64> {
        let mut versions: Vec<i64> =
            self.usage.lock().iter().filter(|(_, &count)| count > 0).map(|(&ts, _)| ts).collect();
        versions.sort_unstable();
        versions
    }

    /// Checkpoints `wal` by running `checkpoint` on it.
    ///
    /// Only one checkpoint may run at a time, only on the primary, and only
    /// for the current version. On success the version is frozen and a new
    /// current version is created; on failure it stays writable so the
    /// checkpoint can be retried.
    pub fn checkpoint<F>(&self, wal: &Arc<DatabaseWal>, checkpoint: F) -> Result<()>
    where
        F: FnOnce(&DatabaseWal) -> Result<()>,
    {
        if !self.role.is_primary() {
            return Err(StorageError::CheckpointOnReplica);
        }

        {
            let mut checkpointing = self.checkpointing.lock();
            if *checkpointing {
                return Err(StorageError::CheckpointInProgress { branch: self.branch.to_string() });
            }
            *checkpointing = true;
        }
        let _guard = CheckpointingGuard(&self.checkpointing);

        let newest = self.versions.read().keys().next_back().copied().unwrap_or(0);
        if wal.is_checkpointed() || newest != wal.timestamp() {
            return Err(StorageError::WalVersionSuperseded {
                version: wal.timestamp(),
                current: newest,
            });
        }

        wal.set_checkpointing(true);
        if let Err(e) = checkpoint(wal) {
            wal.set_checkpointing(false);
            return Err(e);
        }

        wal.mark_checkpointed();
        self.last_checkpointed_version.fetch_max(wal.timestamp(), Ordering::SeqCst);
        debug!(branch = %self.branch, version = wal.timestamp(), "WAL version checkpointed");

        if let Err(e) = self.create() {
            // The next acquire creates the version lazily.
            warn!(branch = %self.branch, error = %e, "Failed to create WAL version after checkpoint");
        }
        Ok(())
    }

    /// Runs `f` inside the checkpoint barrier.
    ///
    /// Writers and checkpoints both pass through the barrier, so a write
    /// never lands in a version that is being finalized.
    pub fn checkpoint_barrier<T>(&self, f: impl FnOnce() -> T) -> T {
        let _barrier = self.barrier.lock();
        f()
    }

    /// Deletes checkpointed versions no node still needs.
    ///
    /// The bound is the oldest version referenced locally or reported by any
    /// replica. Without any constraint nothing is deleted, and if a replica
    /// fails to answer the run is skipped.
    pub async fn run_garbage_collection(&self) -> Result<GcStats> {
        if !self.role.is_primary() {
            return Err(StorageError::GarbageCollectionOnReplica);
        }

        let local_oldest = self.in_use_versions().first().copied();
        let replicas = self.survey.survey(&self.branch).await;
        if !replicas.is_complete() {
            debug!(
                branch = %self.branch,
                responded = replicas.responded,
                surveyed = replicas.surveyed,
                "Skipping WAL garbage collection, replica survey incomplete"
            );
            metrics::record_gc_run("skipped");
            return Ok(GcStats { skipped: true, ..GcStats::default() });
        }

        let bound = match (local_oldest, replicas.oldest_version) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                metrics::record_gc_run("unconstrained");
                return Ok(GcStats::default());
            }
        };

        let doomed: Vec<Arc<DatabaseWal>> = {
            let usage = self.usage.lock();
            let mut versions = self.versions.write();
            let newest = versions.keys().next_back().copied();

            let eligible: Vec<i64> = versions
                .range(..bound)
                .filter(|(&ts, wal)| {
                    Some(ts) != newest
                        && wal.is_checkpointed()
                        && usage.get(&ts).copied().unwrap_or(0) == 0
                })
                .map(|(&ts, _)| ts)
                .collect();

            let doomed = eligible.iter().filter_map(|ts| versions.remove(ts)).collect();
            metrics::record_wal_versions(&self.branch, versions.len());
            doomed
        };

        let mut stats = GcStats { bound: Some(bound), ..GcStats::default() };
        let mut errors = Vec::new();
        for wal in doomed {
            match self.fs.remove(wal.path()) {
                Ok(()) => stats.removed.push(wal.timestamp()),
                Err(e) => {
                    error!(branch = %self.branch, version = wal.timestamp(), error = %e, "Failed to delete WAL version");
                    errors.push(StorageError::Io(e));
                }
            }
        }

        metrics::record_wal_versions_collected(stats.removed.len());
        if !errors.is_empty() {
            metrics::record_gc_run("failed");
            return Err(StorageError::Aggregate { operation: "WAL garbage collection", errors });
        }

        metrics::record_gc_run("completed");
        if !stats.removed.is_empty() {
            info!(branch = %self.branch, bound, removed = stats.removed.len(), "Collected WAL versions");
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for DatabaseWalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseWalManager")
            .field("branch", &self.branch)
            .field("versions", &self.versions())
            .finish_non_exhaustive()
    }
}
