// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Storage metrics.
//!
//! This module describes and records storage-level metrics:
//! - WAL versions per branch and garbage-collected versions
//! - Checkpoints attempted, committed and rolled back
//! - Pages written by checkpoints

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use basalt_core::BranchKey;

/// Initialize storage metric descriptions (call once at startup).
pub fn init_storage_metrics() {
    describe_gauge!("basalt_wal_versions", "Number of WAL versions held for a branch");
    describe_counter!("basalt_wal_versions_created_total", "WAL versions created");
    describe_counter!(
        "basalt_wal_versions_collected_total",
        "WAL versions deleted by garbage collection"
    );
    describe_counter!("basalt_checkpoints_total", "Checkpoints by outcome");
    describe_counter!("basalt_checkpoint_pages_total", "Pages written by checkpoints");
    describe_histogram!(
        "basalt_checkpoint_duration_seconds",
        "Time from checkpoint begin to commit"
    );
    describe_counter!("basalt_gc_runs_total", "WAL garbage collection runs by outcome");
}

pub(crate) fn record_wal_versions(branch: &BranchKey, count: usize) {
    gauge!("basalt_wal_versions", "branch" => branch.to_string()).set(count as f64);
}

pub(crate) fn record_wal_version_created() {
    counter!("basalt_wal_versions_created_total").increment(1);
}

pub(crate) fn record_wal_versions_collected(count: usize) {
    counter!("basalt_wal_versions_collected_total").increment(count as u64);
}

pub(crate) fn record_checkpoint(outcome: &'static str) {
    counter!("basalt_checkpoints_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_checkpoint_commit(pages: u64, seconds: f64) {
    counter!("basalt_checkpoint_pages_total").increment(pages);
    histogram!("basalt_checkpoint_duration_seconds").record(seconds);
}

pub(crate) fn record_gc_run(outcome: &'static str) {
    counter!("basalt_gc_runs_total", "outcome" => outcome).increment(1);
}
