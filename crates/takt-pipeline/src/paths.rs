// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::PipelineResult;

/// Default ceiling when waiting for a pipeline result to appear.
pub const RESULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Sleep between polls of the result file.
pub const RESULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub fn pipe_sessions_dir(project_root: &Path) -> PathBuf {
    project_root.join(".pipe_sessions")
}

/// Path separators in hierarchical ids are flattened so every pipeline
/// artifact lives directly under `.pipe_sessions/`.
fn flat_id(session_id: &str) -> String {
    session_id.replace('/', "__")
}

pub fn tasks_file(project_root: &Path, parent_session_id: &str) -> PathBuf {
    pipe_sessions_dir(project_root).join(format!("{}_tasks.json", flat_id(parent_session_id)))
}

pub fn result_file(project_root: &Path, parent_session_id: &str) -> PathBuf {
    pipe_sessions_dir(project_root).join(format!(
        "{}_serial_result.json",
        flat_id(parent_session_id)
    ))
}

pub fn todos_file(project_root: &Path, session_id: &str) -> PathBuf {
    pipe_sessions_dir(project_root).join(format!("{}_todos.json", flat_id(session_id)))
}

/// Poll for the pipeline result file with bounded sleeps. Returns the parsed
/// result, or `None` when the timeout elapses first.
pub fn wait_for_result(
    project_root: &Path,
    parent_session_id: &str,
    timeout: Duration,
) -> anyhow::Result<Option<PipelineResult>> {
    let path = result_file(project_root, parent_session_id);
    let start = Instant::now();
    loop {
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            return Ok(Some(serde_json::from_str(&text)?));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        std::thread::sleep(RESULT_POLL_INTERVAL.min(timeout));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_follow_convention() {
        let root = Path::new("/proj");
        assert_eq!(
            tasks_file(root, "abc"),
            PathBuf::from("/proj/.pipe_sessions/abc_tasks.json")
        );
        assert_eq!(
            result_file(root, "abc"),
            PathBuf::from("/proj/.pipe_sessions/abc_serial_result.json")
        );
        assert_eq!(
            todos_file(root, "abc"),
            PathBuf::from("/proj/.pipe_sessions/abc_todos.json")
        );
    }

    #[test]
    fn hierarchical_ids_are_flattened() {
        let root = Path::new("/proj");
        assert_eq!(
            tasks_file(root, "a/b"),
            PathBuf::from("/proj/.pipe_sessions/a__b_tasks.json")
        );
    }

    #[test]
    fn wait_times_out_when_no_result() {
        let dir = tempfile::tempdir().unwrap();
        let got = wait_for_result(dir.path(), "none", Duration::from_millis(10)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn wait_returns_existing_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = result_file(dir.path(), "p1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            serde_json::json!({
                "status": "success",
                "total_tasks": 0,
                "completed_tasks": 0,
                "child_session_ids": [],
                "results": [],
                "timestamp": "t"
            })
            .to_string(),
        )
        .unwrap();
        let got = wait_for_result(dir.path(), "p1", Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(got.status, crate::PipelineStatus::Success);
    }
}
