// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::StoreError;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// A lock file older than this is presumed abandoned and is reclaimed.
pub const STALE_LOCK_THRESHOLD: Duration = Duration::from_secs(300);

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive cross-process advisory lock keyed by a lock-file path.
///
/// Possession is the existence of the file, created atomically with
/// O_CREAT|O_EXCL. The file carries no state beyond its existence; release is
/// deletion. A crashed holder leaves the file behind, which contending
/// processes reclaim once its age exceeds [`STALE_LOCK_THRESHOLD`].
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    held: bool,
}

impl FileLock {
    /// Block until the lock is held, or fail with `LockTimeout`.
    pub fn acquire(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, StoreError> {
        let path = path.into();
        let start = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => {
                    return Ok(Self { path, held: true });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    reclaim_if_stale(&path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // The lock's parent directory does not exist yet.
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    continue;
                }
                Err(e) => return Err(StoreError::Io(e)),
            }

            if start.elapsed() >= timeout {
                return Err(StoreError::LockTimeout { path, timeout });
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Delete the lock file. Non-existence is not an error; I/O failures are
    /// logged and swallowed — stale detection catches a lost release.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release lock file");
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn reclaim_if_stale(path: &Path) {
    let age = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => match modified.elapsed() {
            Ok(age) => age,
            Err(_) => return,
        },
        // The holder may have released between our create attempt and here.
        Err(_) => return,
    };

    if age > STALE_LOCK_THRESHOLD {
        warn!(
            path = %path.display(),
            age_secs = age.as_secs(),
            "removing stale lock file"
        );
        if let Err(e) = fs::remove_file(path) {
            // Retried on the next acquire iteration.
            debug!(path = %path.display(), error = %e, "stale lock removal failed");
        }
    }
}

// ─── Locked JSON helpers ──────────────────────────────────────────────────────

/// Read a JSON file under its lock. A missing, empty, or undecodable file
/// yields `default` when one is given, otherwise an error.
pub fn read_json_locked<T: DeserializeOwned>(
    lock_path: &Path,
    file_path: &Path,
    default: Option<T>,
) -> Result<T, StoreError> {
    let _lock = FileLock::acquire(lock_path, DEFAULT_LOCK_TIMEOUT)?;
    read_json_unlocked(file_path, default)
}

/// Write a JSON file (pretty-printed) under its lock.
pub fn write_json_locked<T: Serialize>(
    lock_path: &Path,
    file_path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let _lock = FileLock::acquire(lock_path, DEFAULT_LOCK_TIMEOUT)?;
    write_json_unlocked(file_path, value)
}

/// Read-modify-write a JSON file under a single lock hold.
pub fn modify_json_locked<T: Serialize + DeserializeOwned>(
    lock_path: &Path,
    file_path: &Path,
    default: Option<T>,
    modify: impl FnOnce(&mut T),
) -> Result<(), StoreError> {
    let _lock = FileLock::acquire(lock_path, DEFAULT_LOCK_TIMEOUT)?;
    let mut value = read_json_unlocked(file_path, default)?;
    modify(&mut value);
    write_json_unlocked(file_path, &value)
}

fn read_json_unlocked<T: DeserializeOwned>(
    file_path: &Path,
    default: Option<T>,
) -> Result<T, StoreError> {
    let text = match fs::read_to_string(file_path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return default.ok_or_else(|| StoreError::Io(e));
        }
        Err(e) => return Err(StoreError::Io(e)),
    };
    match serde_json::from_str(&text) {
        Ok(v) => Ok(v),
        Err(e) => default.ok_or_else(|| StoreError::Corrupt {
            id: file_path.display().to_string(),
            source: e,
        }),
    }
}

fn write_json_unlocked<T: Serialize>(file_path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(file_path, text)?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
