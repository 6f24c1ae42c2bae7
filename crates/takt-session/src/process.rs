// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::StoreError;

/// PID-file directory recording the live subprocess for each session id.
///
/// A PID file exists iff a process is executing that session right now: it is
/// created on start, removed on exit, and a file left behind by a crashed
/// process is reclaimed as soon as its pid is found dead. Combined with the
/// per-session file lock this prevents two agent loops from advancing the
/// same session.
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    dir: PathBuf,
}

impl ProcessRegistry {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            dir: project_root.as_ref().join(".processes"),
        }
    }

    fn pid_path(&self, session_id: &str) -> PathBuf {
        let mut path = self.dir.clone();
        for part in session_id
            .split('/')
            .filter(|p| !p.is_empty() && *p != "." && *p != "..")
        {
            path.push(part);
        }
        path.set_extension("pid");
        path
    }

    /// Record `pid` as the live process for the session. Refused when a
    /// recorded pid is still alive; a dead leftover is reclaimed in place.
    pub fn register(&self, session_id: &str, pid: u32) -> Result<(), StoreError> {
        let path = self.pid_path(session_id);
        if let Some(recorded) = read_pid(&path) {
            if pid_alive(recorded) {
                return Err(StoreError::SessionBusy {
                    id: session_id.to_string(),
                    pid: recorded,
                });
            }
            debug!(session_id, stale_pid = recorded, "reclaiming dead pid file");
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, pid.to_string())?;
        Ok(())
    }

    /// True when a pid file exists and its process is alive. A file whose
    /// process is gone is cleaned up on the way out.
    pub fn is_running(&self, session_id: &str) -> bool {
        self.running_pid(session_id).is_some()
    }

    /// The live pid recorded for the session, if any. A file whose process is
    /// gone is cleaned up on the way out.
    pub fn running_pid(&self, session_id: &str) -> Option<u32> {
        let path = self.pid_path(session_id);
        match read_pid(&path) {
            Some(pid) if pid_alive(pid) => Some(pid),
            Some(_) => {
                let _ = fs::remove_file(&path);
                None
            }
            None => None,
        }
    }

    /// Remove the pid file. Tolerant of already-missing files.
    pub fn cleanup(&self, session_id: &str) {
        let path = self.pid_path(session_id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "pid file cleanup failed");
            }
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 probes for existence without delivering anything. EPERM still
    // means the process exists.
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // Without a cheap liveness probe, a recorded pid is assumed alive; the
    // stale-lock sweep remains the backstop.
    true
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
