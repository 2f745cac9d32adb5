// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Core types and utilities for Basalt.
//!
//! This crate provides the building blocks shared by the cluster and storage
//! layers:
//! - Configuration management
//! - Error types
//! - Branch identifiers and node membership
//! - The role and WAL-usage traits that connect leadership to storage

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod role;
pub mod types;

pub use config::{
    ClusterConfig, Config, LogFormat, LoggingConfig, MetricsConfig, NodeConfig, PeerConfig,
    StorageConfig,
};
pub use error::{Error, Result};
pub use role::{
    FixedRole, NoReplicas, NodeRole, ReplicaWalSurvey, ReplicaWalUsage, WalUsageProvider,
};
pub use types::{unix_millis, unix_nanos, unix_secs, BranchKey, Membership};
