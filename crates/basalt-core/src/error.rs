// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by all Basalt crates.

use thiserror::Error;

/// A specialized `Result` type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading configuration or talking to peers.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A cluster peer could not be queried.
    #[error("cluster request failed: {0}")]
    Cluster(String),
}
