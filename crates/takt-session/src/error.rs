// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::time::Duration;

/// Storage-layer error taxonomy. Lock timeouts, corrupt files, and missing
/// parents propagate to the caller; the CLI maps them to exit code 1.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("could not acquire lock on {path} within {timeout:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("session file for '{id}' is corrupt: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("session '{id}' not found")]
    NotFound { id: String },

    #[error("parent session '{id}' not found")]
    MissingParent { id: String },

    #[error("session id collision for '{id}'")]
    IdCollision { id: String },

    #[error("session '{id}' is already running (pid {pid})")]
    SessionBusy { id: String, pid: u32 },

    #[error("{0}")]
    InvalidOperation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
