// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-branch write and checkpoint coordination.
//!
//! The [`ConnectionManager`] owns the WAL manager, checkpointer and page
//! store of every open branch. Every write and every checkpoint on a branch
//! passes through the WAL manager's checkpoint barrier, so a write never
//! lands in a version that is being checkpointed.
//!
//! Periodic checkpointing and garbage collection are driven by tickers
//! spawned with [`ConnectionManager::spawn_checkpoint_ticker`] and
//! [`ConnectionManager::spawn_gc_ticker`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use basalt_core::{BranchKey, NodeRole, ReplicaWalSurvey, StorageConfig, WalUsageProvider};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checkpoint::Checkpointer;
use crate::error::{Result, StorageError};
use crate::fs::FileSystem;
use crate::page_logger::PageLogger;
use crate::page_store::PageStore;
use crate::wal::{self, DatabaseWal, DatabaseWalManager, GcStats, WalOptions};

/// Everything needed to write and checkpoint one branch.
pub struct BranchResources {
    wal_manager: Arc<DatabaseWalManager>,
    checkpointer: Arc<Checkpointer>,
    page_store: Arc<PageStore>,
    checkpoint_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl BranchResources {
    /// The branch's WAL manager.
    pub fn wal_manager(&self) -> &Arc<DatabaseWalManager> {
        &self.wal_manager
    }

    /// The branch's checkpointer.
    pub fn checkpointer(&self) -> &Arc<Checkpointer> {
        &self.checkpointer
    }

    /// The branch's page store.
    pub fn page_store(&self) -> &Arc<PageStore> {
        &self.page_store
    }

    /// Returns true if the branch was written since its last checkpoint.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}

/// Outcome of one [`ConnectionManager::checkpoint_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointSummary {
    /// Branches that were checkpointed.
    pub checkpointed: usize,
    /// Branches skipped because another checkpoint held them.
    pub busy: usize,
    /// Branches whose checkpoint failed.
    pub failed: usize,
}

/// Coordinates writes, checkpoints and garbage collection across branches.
pub struct ConnectionManager {
    fs: Arc<dyn FileSystem>,
    role: Arc<dyn NodeRole>,
    survey: Arc<dyn ReplicaWalSurvey>,
    page_logger: Arc<dyn PageLogger>,
    config: StorageConfig,
    branches: DashMap<BranchKey, Arc<BranchResources>>,
}

impl ConnectionManager {
    /// Creates a connection manager. Branches are opened on first use.
    pub fn new(
        fs: Arc<dyn FileSystem>,
        role: Arc<dyn NodeRole>,
        survey: Arc<dyn ReplicaWalSurvey>,
        page_logger: Arc<dyn PageLogger>,
        config: StorageConfig,
    ) -> Self {
        Self { fs, role, survey, page_logger, config, branches: DashMap::new() }
    }

    /// Returns the resources of a branch, opening them if needed.
    ///
    /// On the primary, opening a branch rolls back any checkpoint a crash
    /// left open. Other nodes leave the shared checkpoint state alone.
    pub fn branch(&self, key: &BranchKey) -> Result<Arc<BranchResources>> {
        if let Some(existing) = self.branches.get(key) {
            return Ok(Arc::clone(existing.value()));
        }

        let entry = self.branches.entry(key.clone()).or_try_insert_with(|| self.open_branch(key))?;
        Ok(Arc::clone(entry.value()))
    }

    fn open_branch(&self, key: &BranchKey) -> Result<Arc<BranchResources>> {
        let page_store =
            Arc::new(PageStore::open(Arc::clone(&self.fs), key, self.config.page_size)?);
        let checkpointer = Arc::new(Checkpointer::open(
            Arc::clone(&self.fs),
            key.clone(),
            Arc::clone(&page_store),
            Arc::clone(&self.page_logger),
            Arc::clone(&self.role),
        )?);
        let wal_manager = Arc::new(DatabaseWalManager::open(
            Arc::clone(&self.fs),
            key.clone(),
            Arc::clone(&self.role),
            Arc::clone(&self.survey),
            WalOptions::from(&self.config),
        )?);

        let dirty = wal_manager.current().is_some_and(|wal| wal.requires_checkpoint());
        info!(branch = %key, page_count = page_store.page_count(), dirty, "Opened branch");

        Ok(Arc::new(BranchResources {
            wal_manager,
            checkpointer,
            page_store,
            checkpoint_lock: Mutex::new(()),
            dirty: AtomicBool::new(dirty),
        }))
    }

    /// Returns the keys of every open branch.
    pub fn branches(&self) -> Vec<BranchKey> {
        self.branches.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Runs a write against the current WAL version of a branch.
    ///
    /// The version is referenced and `f` runs inside the checkpoint barrier.
    /// Only the primary may write. The WAL is synced (subject to its sync interval) before returning.
    pub fn write<T>(
        &self,
        key: &BranchKey,
        f: impl FnOnce(&DatabaseWal) -> Result<T>,
    ) -> Result<T> {
        let branch = self.branch(key)?;
        let manager = &branch.wal_manager;

        let result = manager.checkpoint_barrier(|| {
            let version = manager.acquire()?;
            if !self.role.is_primary() {
                manager.release(version);
                return Err(StorageError::WriteOnReplica { version });
            }
            let outcome = manager.get(version).and_then(|wal| {
                let value = f(wal.as_ref())?;
                wal.sync()?;
                Ok(value)
            });
            manager.release(version);
            outcome
        });

        if result.is_ok() {
            branch.dirty.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Runs a read against the current WAL version and page store of a branch.
    ///
    /// The version stays referenced while `f` runs, which keeps garbage
    /// collection (here and, through the usage survey, on the primary) away
    /// from it.
    pub fn read<T>(
        &self,
        key: &BranchKey,
        f: impl FnOnce(&DatabaseWal, &PageStore) -> Result<T>,
    ) -> Result<T> {
        let branch = self.branch(key)?;
        let manager = &branch.wal_manager;
        if !self.role.is_primary() {
            manager.refresh()?;
            branch.page_store.reload()?;
        }

        let version = manager.acquire()?;
        let result = manager.get(version).and_then(|wal| f(wal.as_ref(), branch.page_store.as_ref()));
        manager.release(version);
        result
    }

    /// Checkpoints one branch, waiting for any checkpoint already running.
    ///
    /// Returns false if the current version held nothing to checkpoint.
    pub fn checkpoint(&self, key: &BranchKey) -> Result<bool> {
        if !self.role.is_primary() {
            return Err(StorageError::CheckpointOnReplica);
        }
        let branch = self.branch(key)?;
        let _guard = branch.checkpoint_lock.lock();
        branch.dirty.store(false, Ordering::SeqCst);
        let result = Self::checkpoint_branch(&branch);
        if result.is_err() {
            branch.dirty.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Checkpoints every branch written since its last checkpoint.
    ///
    /// Contention is not a failure: a branch that is busy is retried on the
    /// next call.
    pub fn checkpoint_all(&self) -> CheckpointSummary {
        let mut summary = CheckpointSummary::default();
        if !self.role.is_primary() {
            return summary;
        }

        let branches: Vec<(BranchKey, Arc<BranchResources>)> = self
            .branches
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (key, branch) in branches {
            if !branch.is_dirty() {
                continue;
            }
            let Some(_guard) = branch.checkpoint_lock.try_lock() else {
                debug!(branch = %key, "Checkpoint busy, retrying next tick");
                summary.busy += 1;
                continue;
            };

            branch.dirty.store(false, Ordering::SeqCst);
            match Self::checkpoint_branch(&branch) {
                Ok(true) => summary.checkpointed += 1,
                Ok(false) => {}
                Err(e) if e.is_contention() => {
                    debug!(branch = %key, error = %e, "Checkpoint contended, retrying next tick");
                    branch.dirty.store(true, Ordering::SeqCst);
                    summary.busy += 1;
                }
                Err(e) if e.is_role_violation() => {
                    debug!(branch = %key, error = %e, "Lost primary role, skipping checkpoint");
                    branch.dirty.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    error!(branch = %key, error = %e, "Checkpoint failed");
                    branch.dirty.store(true, Ordering::SeqCst);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    fn checkpoint_branch(branch: &BranchResources) -> Result<bool> {
        let manager = &branch.wal_manager;
        manager.checkpoint_barrier(|| {
            let wal = match manager.current() {
                Some(wal) if wal.requires_checkpoint() => wal,
                _ => return Ok(false),
            };
            manager.checkpoint(&wal, |wal| copy_committed_pages(&branch.checkpointer, wal))?;
            Ok(true)
        })
    }

    /// Runs WAL garbage collection for one branch.
    ///
    /// The current version is referenced for the duration of the run, so it
    /// bounds collection even when nothing else is in use.
    pub async fn collect_garbage(&self, key: &BranchKey) -> Result<GcStats> {
        let branch = self.branch(key)?;
        let manager = &branch.wal_manager;
        let pinned = manager.acquire()?;
        let result = manager.run_garbage_collection().await;
        manager.release(pinned);
        result
    }

    /// Runs WAL garbage collection for every open branch. Only the primary
    /// collects garbage.
    pub async fn collect_garbage_all(&self) -> usize {
        if !self.role.is_primary() {
            return 0;
        }

        let mut removed = 0;
        for key in self.branches() {
            match self.collect_garbage(&key).await {
                Ok(stats) => removed += stats.removed.len(),
                Err(e) if e.is_role_violation() => break,
                Err(e) => warn!(branch = %key, error = %e, "WAL garbage collection failed"),
            }
        }
        removed
    }

    /// Spawns a task calling [`checkpoint_all`] every `period` until
    /// `shutdown` flips to true.
    ///
    /// [`checkpoint_all`]: ConnectionManager::checkpoint_all
    pub fn spawn_checkpoint_ticker(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let manager = Arc::clone(&manager);
                        match tokio::task::spawn_blocking(move || manager.checkpoint_all()).await {
                            Ok(summary) if summary.checkpointed > 0 || summary.failed > 0 => {
                                debug!(
                                    checkpointed = summary.checkpointed,
                                    busy = summary.busy,
                                    failed = summary.failed,
                                    "Checkpoint tick"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Checkpoint task panicked"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Checkpoint ticker stopped");
        })
    }

    /// Spawns a task calling [`collect_garbage_all`] every `period` until
    /// `shutdown` flips to true.
    ///
    /// [`collect_garbage_all`]: ConnectionManager::collect_garbage_all
    pub fn spawn_gc_ticker(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = manager.collect_garbage_all().await;
                        if removed > 0 {
                            debug!(removed, "Garbage collection tick");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Garbage collection ticker stopped");
        })
    }
}

impl WalUsageProvider for ConnectionManager {
    fn wal_versions_in_use(&self, branch: &BranchKey) -> Vec<i64> {
        self.branches
            .get(branch)
            .map(|resources| resources.wal_manager.in_use_versions())
            .unwrap_or_default()
    }
}

/// Checkpoints the committed pages of `wal`, rolling back on failure.
fn copy_committed_pages(checkpointer: &Checkpointer, wal: &DatabaseWal) -> Result<()> {
    let scan = wal::scan(wal)?;
    let page_size = checkpointer.page_store().page_size();
    if !scan.is_empty() && scan.page_size != page_size {
        return Err(StorageError::Corrupt {
            what: "WAL",
            reason: format!("page size {} does not match store page size {page_size}", scan.page_size),
        });
    }

    checkpointer.begin(wal.timestamp())?;
    let copied = scan
        .pages
        .iter()
        .try_for_each(|(&page_number, data)| checkpointer.checkpoint_page(page_number, data))
        .and_then(|()| checkpointer.commit());

    if let Err(e) = copied {
        warn!(version = wal.timestamp(), error = %e, "Checkpoint failed, rolling back");
        if let Err(rollback) = checkpointer.rollback() {
            error!(version = wal.timestamp(), error = %rollback, "Checkpoint rollback failed");
            return Err(StorageError::Aggregate { operation: "checkpoint", errors: vec![e, rollback] });
        }
        return Err(e);
    }
    Ok(())
}
