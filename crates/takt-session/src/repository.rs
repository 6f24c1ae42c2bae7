// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::lock::{modify_json_locked, read_json_locked, FileLock, DEFAULT_LOCK_TIMEOUT};
use crate::model::{Session, SessionIndex, SessionOverview};
use crate::StoreError;

/// Filesystem persistence for session aggregates.
///
/// Layout under the sessions directory:
///
/// ```text
/// sessions/
///   index.json                      # { sessions: { id → overview } }
///   index.json.lock
///   <hash>.json                     # root session
///   <hash>/<child-hash>.json        # child session
///   backups/<sha256(id)>-<ts>.json
/// ```
///
/// Every session-file access runs under that session's lock; every index
/// mutation runs under the index lock. The deletion path is the only place
/// both are held, session lock first.
#[derive(Debug)]
pub struct SessionRepository {
    sessions_dir: PathBuf,
    backups_dir: PathBuf,
    index_path: PathBuf,
    index_lock_path: PathBuf,
}

impl SessionRepository {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let sessions_dir = sessions_dir.into();
        let backups_dir = sessions_dir.join("backups");
        fs::create_dir_all(&sessions_dir)?;
        fs::create_dir_all(&backups_dir)?;
        let index_path = sessions_dir.join("index.json");
        let index_lock_path = sessions_dir.join("index.json.lock");
        let repo = Self {
            sessions_dir,
            backups_dir,
            index_path,
            index_lock_path,
        };
        if !repo.index_path.exists() {
            crate::lock::write_json_locked(
                &repo.index_lock_path,
                &repo.index_path,
                &SessionIndex::default(),
            )?;
        }
        Ok(repo)
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Split an id on `/` and drop empty, `.`, and `..` components so that no
    /// derived path can escape the sessions directory.
    fn sanitize_parts(session_id: &str) -> Vec<&str> {
        session_id
            .split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .collect()
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        let mut path = self.sessions_dir.clone();
        for part in Self::sanitize_parts(session_id) {
            path.push(part);
        }
        path.set_extension("json");
        path
    }

    /// The directory that holds a session's children, if any.
    fn session_dir_path(&self, session_id: &str) -> PathBuf {
        let mut path = self.sessions_dir.clone();
        for part in Self::sanitize_parts(session_id) {
            path.push(part);
        }
        path
    }

    fn session_lock_path(&self, session_id: &str) -> PathBuf {
        let mut path = self.session_path(session_id).into_os_string();
        path.push(".lock");
        PathBuf::from(path)
    }

    pub fn save(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.session_path(&session.session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _lock = FileLock::acquire(
            self.session_lock_path(&session.session_id),
            DEFAULT_LOCK_TIMEOUT,
        )?;
        fs::write(&path, encode_session(session)?)?;
        Ok(())
    }

    pub fn find(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let path = self.session_path(session_id);
        let _lock = FileLock::acquire(self.session_lock_path(session_id), DEFAULT_LOCK_TIMEOUT)?;
        self.read_session_file(session_id, &path)
    }

    /// Read-modify-write a session under a single lock hold. The modify
    /// closure's return value is passed through.
    pub fn update<R>(
        &self,
        session_id: &str,
        modify: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, StoreError> {
        let path = self.session_path(session_id);
        let _lock = FileLock::acquire(self.session_lock_path(session_id), DEFAULT_LOCK_TIMEOUT)?;
        let mut session = self
            .read_session_file(session_id, &path)?
            .ok_or_else(|| StoreError::NotFound {
                id: session_id.to_string(),
            })?;
        let result = modify(&mut session);
        fs::write(&path, encode_session(&session)?)?;
        Ok(result)
    }

    fn read_session_file(
        &self,
        session_id: &str,
        path: &Path,
    ) -> Result<Option<Session>, StoreError> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };
        // Corrupt JSON is a read failure, never silently overwritten.
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                id: session_id.to_string(),
                source: e,
            })
    }

    pub fn list(&self) -> Result<BTreeMap<String, SessionOverview>, StoreError> {
        let index: SessionIndex = read_json_locked(
            &self.index_lock_path,
            &self.index_path,
            Some(SessionIndex::default()),
        )?;
        Ok(index.sessions)
    }

    /// Copy the session file to `backups/<sha256(id)>-<ts>.json`.
    /// `timestamp` is expected in a filename-safe compact form.
    pub fn backup(&self, session_id: &str, timestamp: &str) -> Result<(), StoreError> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(());
        }
        let name = format!("{}-{}.json", id_hash(session_id), timestamp);
        fs::copy(&path, self.backups_dir.join(name))?;
        Ok(())
    }

    /// Delete the session file and its child subtree, scrub matching backups,
    /// and drop the index entry plus all descendant entries.
    ///
    /// Lock ordering: the session lock is taken first and held across the
    /// index mutation — this is the one path permitted to hold both.
    pub fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let mut session_lock =
            FileLock::acquire(self.session_lock_path(session_id), DEFAULT_LOCK_TIMEOUT)?;

        let subtree = self.session_dir_path(session_id);
        if subtree.is_dir() {
            fs::remove_dir_all(&subtree)?;
        }
        let path = self.session_path(session_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }

        let backup_prefix = format!("{}-", id_hash(session_id));
        if let Ok(entries) = fs::read_dir(&self.backups_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(&backup_prefix) {
                    debug!(file = %name.to_string_lossy(), "removing session backup");
                    let _ = fs::remove_file(entry.path());
                }
            }
        }

        let descendant_prefix = format!("{session_id}/");
        modify_json_locked(
            &self.index_lock_path,
            &self.index_path,
            Some(SessionIndex::default()),
            |index: &mut SessionIndex| {
                index
                    .sessions
                    .retain(|id, _| id != session_id && !id.starts_with(&descendant_prefix));
            },
        )?;

        session_lock.release();
        Ok(())
    }

    /// Read-modify-write on the index; `last_updated` is always refreshed.
    pub fn update_index(
        &self,
        session_id: &str,
        purpose: Option<&str>,
        created_at: Option<&str>,
        now: &str,
    ) -> Result<(), StoreError> {
        modify_json_locked(
            &self.index_lock_path,
            &self.index_path,
            Some(SessionIndex::default()),
            |index: &mut SessionIndex| {
                let entry = index.sessions.entry(session_id.to_string()).or_default();
                entry.last_updated = now.to_string();
                if let Some(p) = purpose {
                    entry.purpose = Some(p.to_string());
                }
                if let Some(c) = created_at {
                    entry.created_at = Some(c.to_string());
                }
            },
        )
    }
}

fn encode_session(session: &Session) -> Result<String, StoreError> {
    serde_json::to_string_pretty(session)
        .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

/// Stable hash of a session id, used for backup file names.
pub(crate) fn id_hash(session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hex::encode(hasher.finalize())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
