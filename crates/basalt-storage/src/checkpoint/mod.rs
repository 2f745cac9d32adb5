// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Crash-safe checkpointing of WAL pages into the page store.

mod checkpointer;
mod marker;

pub use checkpointer::Checkpointer;
pub use marker::{marker_path, Checkpoint, MARKER_SIZE};
