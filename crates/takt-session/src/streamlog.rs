// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Per-session diagnostic log written while a streaming round is in flight
/// (`CACHE_DECISION` and `RAW_CHUNK` lines) and removed when the invocation
/// completes. Logging must never abort a run: every failure is swallowed
/// after a debug trace.
#[derive(Debug, Clone)]
pub struct StreamingLog {
    path: PathBuf,
}

impl StreamingLog {
    pub fn new(sessions_dir: impl AsRef<Path>, session_id: &str) -> Self {
        let mut path = sessions_dir.as_ref().to_path_buf();
        for part in session_id
            .split('/')
            .filter(|p| !p.is_empty() && *p != "." && *p != "..")
        {
            path.push(part);
        }
        let mut os = path.into_os_string();
        os.push(".streaming.log");
        Self {
            path: PathBuf::from(os),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, kind: &str, message: &str, timestamp: &str) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            writeln!(file, "[{timestamp}] [{kind}] {message}")
        };
        if let Err(e) = write() {
            debug!(path = %self.path.display(), error = %e, "streaming log write failed");
        }
    }

    /// Remove the log after the model response is complete.
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "streaming log cleanup failed");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
