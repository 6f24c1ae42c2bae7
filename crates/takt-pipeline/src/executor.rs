// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::paths::{result_file, tasks_file};
use crate::task::{
    AgentTask, PipelineResult, PipelineStatus, ScriptTask, Task, TaskExecutionResult, TaskList,
};

// ── Exit codes ────────────────────────────────────────────────────────────────

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_ABORT: i32 = 2;

/// Trailing bytes of captured output kept in previews and retry context.
const OUTPUT_PREVIEW_BYTES: usize = 2000;

/// Executes a task list sequentially on behalf of a parent session:
/// agent tasks spawn fresh CLI invocations, script tasks run with a
/// retry-with-backtrack contract, and the first failure short-circuits the
/// rest. The outcome is written to a result file and handed back to the
/// parent session through one more CLI invocation.
pub struct SerialPipelineExecutor {
    project_root: PathBuf,
    /// Program + leading args used to invoke the CLI (the running binary by
    /// default; tests substitute a stub).
    takt_command: Vec<String>,
}

impl SerialPipelineExecutor {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let exe = std::env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "takt".into());
        Self {
            project_root: project_root.into(),
            takt_command: vec![exe],
        }
    }

    /// Replace the CLI invocation (program + leading args).
    pub fn with_takt_command(mut self, command: Vec<String>) -> Self {
        self.takt_command = command;
        self
    }

    /// Run the full pipeline for `parent_session_id` and return the process
    /// exit code: 0 all tasks succeeded, 1 soft failure, 2 permanent abort.
    pub fn run(&self, parent_session_id: &str) -> anyhow::Result<i32> {
        let tasks_path = tasks_file(&self.project_root, parent_session_id);
        let text = std::fs::read_to_string(&tasks_path)
            .with_context(|| format!("reading task list {}", tasks_path.display()))?;
        let list: TaskList = serde_json::from_str(&text)
            .with_context(|| format!("parsing task list {}", tasks_path.display()))?;

        info!(
            parent = parent_session_id,
            tasks = list.tasks.len(),
            "starting serial execution"
        );

        let results = self.execute_tasks_serially(&list, parent_session_id);
        let child_session_ids = self.save_pipeline_result(parent_session_id, &results)?;

        let all_success = results.iter().all(|r| r.exit_code == 0);
        let aborted = results.iter().any(|r| r.exit_code == EXIT_ABORT);

        self.invoke_parent_session(parent_session_id, &child_session_ids, &results);

        Ok(if all_success {
            EXIT_SUCCESS
        } else if aborted {
            EXIT_ABORT
        } else {
            EXIT_FAILURE
        })
    }

    fn execute_tasks_serially(
        &self,
        list: &TaskList,
        parent_session_id: &str,
    ) -> Vec<TaskExecutionResult> {
        let mut results = Vec::new();
        // The session most recently touched by an agent task; retries resume it.
        let mut last_agent_session_id: Option<String> = list.child_session_id.clone();

        for (i, task) in list.tasks.iter().enumerate() {
            info!(task = i + 1, total = list.tasks.len(), kind = task_type(task), "running task");

            let mut result = match task {
                Task::Agent(agent) => {
                    let result = self.execute_agent_task(
                        agent,
                        list.child_session_id.as_deref(),
                        parent_session_id,
                        list.purpose.as_deref(),
                        list.background.as_deref(),
                    );
                    if let Some(id) = &result.session_id {
                        last_agent_session_id = Some(id.clone());
                    }
                    result
                }
                Task::Script(script) => self.run_script_with_retries(
                    script,
                    &list.tasks[..i],
                    parent_session_id,
                    &mut last_agent_session_id,
                ),
            };

            result.task_index = i;
            let failed = result.exit_code != 0;
            results.push(result);

            if failed {
                warn!(task = i + 1, "task failed, aborting pipeline");
                break;
            }
        }

        results
    }

    /// Run a script task with up to `max_retries + 1` attempts. Before each
    /// retry the nearest preceding agent task is re-run (resuming its
    /// session) with the failing script's output embedded, on the premise
    /// that that agent produced whatever the script validates. Exit code 2 is
    /// a permanent failure and disables retries entirely.
    fn run_script_with_retries(
        &self,
        script: &ScriptTask,
        preceding: &[Task],
        parent_session_id: &str,
        last_agent_session_id: &mut Option<String>,
    ) -> TaskExecutionResult {
        let max_attempts = script.max_retries + 1;
        let mut result = self.execute_script_task(script, parent_session_id);

        for attempt in 1..max_attempts {
            if result.exit_code == 0 {
                break;
            }
            if result.exit_code == EXIT_ABORT {
                warn!("script aborted with exit code 2 (permanent failure, no retries)");
                break;
            }

            info!(attempt, max_retries = script.max_retries, "retrying script task");

            match preceding.iter().rev().find_map(|t| match t {
                Task::Agent(a) => Some(a),
                Task::Script(_) => None,
            }) {
                None => {
                    warn!("no preceding agent task found for retry, retrying script only");
                }
                Some(agent) => {
                    let error_info = result
                        .output_preview
                        .clone()
                        .unwrap_or_else(|| "Script validation failed".into());
                    let retry_task = AgentTask {
                        instruction: format!(
                            "{}\n\nPREVIOUS ATTEMPT FAILED:\nError output from validation script:\n```\n{}\n```\n\nPlease fix the issues and try again.",
                            agent.instruction, error_info
                        ),
                        roles: vec![],
                        references_persist: vec![],
                        procedure: None,
                    };
                    let agent_result = self.execute_agent_task(
                        &retry_task,
                        last_agent_session_id.as_deref(),
                        parent_session_id,
                        None,
                        None,
                    );
                    if let Some(id) = &agent_result.session_id {
                        *last_agent_session_id = Some(id.clone());
                    }
                    if agent_result.exit_code != 0 {
                        warn!(
                            exit_code = agent_result.exit_code,
                            "agent re-execution failed, abandoning retries"
                        );
                        break;
                    }
                }
            }

            result = self.execute_script_task(script, parent_session_id);
        }

        result
    }

    fn execute_agent_task(
        &self,
        task: &AgentTask,
        child_session_id: Option<&str>,
        parent_session_id: &str,
        purpose: Option<&str>,
        background: Option<&str>,
    ) -> TaskExecutionResult {
        let mut args: Vec<String> = Vec::new();
        match child_session_id {
            Some(id) => {
                args.push("--session".into());
                args.push(id.into());
            }
            None => {
                args.push("--purpose".into());
                args.push(purpose.unwrap_or("Delegated pipeline task").into());
                args.push("--background".into());
                args.push(
                    background
                        .unwrap_or("Created by the serial pipeline executor")
                        .into(),
                );
                for role in &task.roles {
                    args.push("--roles".into());
                    args.push(role.clone());
                }
                if let Some(procedure) = &task.procedure {
                    args.push("--procedure".into());
                    args.push(procedure.clone());
                }
                for reference in &task.references_persist {
                    args.push("--references".into());
                    args.push(reference.clone());
                }
                args.push("--parent-session".into());
                args.push(parent_session_id.into());
            }
        }
        args.push("--instruction".into());
        args.push(task.instruction.clone());
        args.push("--output-format".into());
        args.push("json".into());

        let started = Instant::now();
        let output = self.takt(&args);
        let duration = started.elapsed().as_secs_f64();

        match output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let session_id = extract_session_id(&stdout)
                    .or_else(|| child_session_id.map(str::to_string));
                TaskExecutionResult {
                    task_index: 0,
                    task_type: "agent".into(),
                    exit_code: output.status.code().unwrap_or(EXIT_FAILURE),
                    duration_seconds: duration,
                    output_preview: Some(preview(&format!("{stdout}{stderr}"))),
                    session_id,
                }
            }
            Err(e) => TaskExecutionResult {
                task_index: 0,
                task_type: "agent".into(),
                exit_code: EXIT_FAILURE,
                duration_seconds: duration,
                output_preview: Some(format!("failed to spawn agent invocation: {e}")),
                session_id: child_session_id.map(str::to_string),
            },
        }
    }

    fn execute_script_task(
        &self,
        task: &ScriptTask,
        parent_session_id: &str,
    ) -> TaskExecutionResult {
        let started = Instant::now();
        let output = Command::new(&task.script)
            .args(&task.args)
            .current_dir(&self.project_root)
            .env("TAKT_SESSION_ID", parent_session_id)
            .output();
        let duration = started.elapsed().as_secs_f64();

        match output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                TaskExecutionResult {
                    task_index: 0,
                    task_type: "script".into(),
                    exit_code: output.status.code().unwrap_or(EXIT_FAILURE),
                    duration_seconds: duration,
                    output_preview: Some(preview(&format!("{stdout}{stderr}"))),
                    session_id: None,
                }
            }
            Err(e) => TaskExecutionResult {
                task_index: 0,
                task_type: "script".into(),
                exit_code: EXIT_FAILURE,
                duration_seconds: duration,
                output_preview: Some(format!("failed to spawn script '{}': {e}", task.script)),
                session_id: None,
            },
        }
    }

    fn save_pipeline_result(
        &self,
        parent_session_id: &str,
        results: &[TaskExecutionResult],
    ) -> anyhow::Result<Vec<String>> {
        let all_success = results.iter().all(|r| r.exit_code == 0);

        let mut child_session_ids: Vec<String> = Vec::new();
        for result in results {
            if result.task_type == "agent" {
                if let Some(id) = &result.session_id {
                    if !child_session_ids.contains(id) {
                        child_session_ids.push(id.clone());
                    }
                }
            }
        }

        let pipeline_result = PipelineResult {
            status: if all_success {
                PipelineStatus::Success
            } else {
                PipelineStatus::Failed
            },
            total_tasks: results.len(),
            completed_tasks: results.len(),
            child_session_ids: child_session_ids.clone(),
            results: results.to_vec(),
            timestamp: Utc::now().to_rfc3339(),
        };

        let path = result_file(&self.project_root, parent_session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&pipeline_result)?)?;
        info!(path = %path.display(), "pipeline result saved");

        Ok(child_session_ids)
    }

    /// Resume the parent session with an instruction describing the outcome:
    /// permanent failure, the created child ids, or "nothing was created".
    fn invoke_parent_session(
        &self,
        parent_session_id: &str,
        child_session_ids: &[String],
        results: &[TaskExecutionResult],
    ) {
        let abort = results.iter().find(|r| r.exit_code == EXIT_ABORT);

        let instruction = if let Some(abort) = abort {
            let mut text = format!(
                "Task execution ABORTED (exit code 2 - permanent failure)\n\n\
                 Task {} failed with exit code 2, indicating a permanent failure \
                 that cannot be fixed through retries.\n\n",
                abort.task_index + 1
            );
            if let Some(output) = &abort.output_preview {
                text.push_str(&format!("Abort reason:\n```\n{output}\n```\n\n"));
            }
            text.push_str(
                "This typically indicates:\n\
                 - Unauthorized file modifications detected\n\
                 - Validation failures that require manual investigation\n\
                 - Configuration issues that cannot be auto-fixed\n\n\
                 Please investigate the issue manually before retrying.",
            );
            text
        } else if !child_session_ids.is_empty() {
            let ids_json = serde_json::to_string(child_session_ids).unwrap_or_default();
            format!(
                "Child agent tasks completed successfully. To retrieve the results, \
                 use get_sessions_final_turns with the following session IDs:\n\
                 session_ids={ids_json}\n\n\
                 Example:\nget_sessions_final_turns(session_ids={ids_json})"
            )
        } else {
            "Task execution completed. No child sessions were created. \
             Check the serial result file for details."
                .to_string()
        };

        let args = vec![
            "--session".to_string(),
            parent_session_id.to_string(),
            "--instruction".to_string(),
            instruction,
        ];
        if let Err(e) = self.takt(&args) {
            warn!(error = %e, "failed to invoke parent session");
        }
    }

    fn takt(&self, args: &[String]) -> std::io::Result<std::process::Output> {
        let mut command = Command::new(&self.takt_command[0]);
        command
            .args(&self.takt_command[1..])
            .args(args)
            .current_dir(&self.project_root);
        command.output()
    }
}

fn task_type(task: &Task) -> &'static str {
    match task {
        Task::Agent(_) => "agent",
        Task::Script(_) => "script",
    }
}

/// Find the session id in an agent invocation's stdout: the CLI prints a
/// single-line JSON object containing `session_id` when run with
/// `--output-format json`.
fn extract_session_id(stdout: &str) -> Option<String> {
    for line in stdout.lines().rev() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            if let Some(id) = value.get("session_id").and_then(|v| v.as_str()) {
                return Some(id.to_string());
            }
        }
    }
    None
}

fn preview(output: &str) -> String {
    if output.len() <= OUTPUT_PREVIEW_BYTES {
        return output.to_string();
    }
    let tail_start = output.len() - OUTPUT_PREVIEW_BYTES;
    // Avoid splitting a UTF-8 sequence.
    let mut start = tail_start;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &output[start..])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// A stub standing in for the `takt` binary: prints a JSON identity line
    /// and logs its arguments for later assertions.
    fn write_takt_stub(dir: &Path) -> String {
        write_script(
            dir,
            "takt-stub.sh",
            r#"echo "$@" >> takt_calls.log
echo '{"session_id": "parent1/child-aaaa"}'"#,
        )
    }

    fn write_tasks(dir: &Path, parent: &str, list: &TaskList) {
        let path = tasks_file(dir, parent);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_string(list).unwrap()).unwrap();
    }

    fn agent(instruction: &str) -> Task {
        Task::Agent(AgentTask {
            instruction: instruction.into(),
            roles: vec![],
            references_persist: vec![],
            procedure: None,
        })
    }

    fn script(path: &str, max_retries: u32) -> Task {
        Task::Script(ScriptTask {
            script: path.into(),
            args: vec![],
            max_retries,
        })
    }

    fn executor(dir: &Path) -> SerialPipelineExecutor {
        let stub = write_takt_stub(dir);
        SerialPipelineExecutor::new(dir).with_takt_command(vec![stub])
    }

    fn read_result(dir: &Path, parent: &str) -> PipelineResult {
        let text = std::fs::read_to_string(result_file(dir, parent)).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn all_tasks_succeed_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        let ok = write_script(dir.path(), "ok.sh", "exit 0");
        write_tasks(
            dir.path(),
            "parent1",
            &TaskList {
                tasks: vec![agent("do the thing"), script(&ok, 0)],
                ..Default::default()
            },
        );

        let code = executor(dir.path()).run("parent1").unwrap();
        assert_eq!(code, EXIT_SUCCESS);

        let result = read_result(dir.path(), "parent1");
        assert_eq!(result.status, PipelineStatus::Success);
        assert_eq!(result.total_tasks, 2);
        assert_eq!(result.child_session_ids, vec!["parent1/child-aaaa"]);
    }

    #[test]
    fn missing_task_list_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(executor(dir.path()).run("ghost").is_err());
    }

    #[test]
    fn failing_script_short_circuits_remaining_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let fail = write_script(dir.path(), "fail.sh", "exit 1");
        write_tasks(
            dir.path(),
            "p",
            &TaskList {
                tasks: vec![script(&fail, 0), agent("never runs")],
                ..Default::default()
            },
        );

        let code = executor(dir.path()).run("p").unwrap();
        assert_eq!(code, EXIT_FAILURE);

        // Exactly the failing task is recorded; the agent task never ran.
        let result = read_result(dir.path(), "p");
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.status, PipelineStatus::Failed);
    }

    #[test]
    fn retry_reruns_preceding_agent_with_error_context() {
        let dir = tempfile::tempdir().unwrap();
        // Fails on the first run, succeeds once a marker file exists; the
        // marker is created by the second run itself.
        let flaky = write_script(
            dir.path(),
            "flaky.sh",
            "if [ -f marker ]; then exit 0; else echo err1 >&2; touch marker; exit 1; fi",
        );
        write_tasks(
            dir.path(),
            "p",
            &TaskList {
                tasks: vec![agent("produce the artifact"), script(&flaky, 1)],
                ..Default::default()
            },
        );

        let code = executor(dir.path()).run("p").unwrap();
        assert_eq!(code, EXIT_SUCCESS);

        // The agent was re-run with the failing output between the markers.
        let calls = std::fs::read_to_string(dir.path().join("takt_calls.log")).unwrap();
        assert!(calls.contains("PREVIOUS ATTEMPT FAILED"), "calls:\n{calls}");
        assert!(calls.contains("err1"), "calls:\n{calls}");
        // The retry resumed the session created by the first agent run.
        assert!(calls.contains("--session parent1/child-aaaa"), "calls:\n{calls}");
    }

    #[test]
    fn exit_code_two_aborts_without_retries() {
        let dir = tempfile::tempdir().unwrap();
        // Would succeed on a retry, but exit 2 must disable retries.
        let fatal = write_script(
            dir.path(),
            "fatal.sh",
            "if [ -f marker ]; then exit 0; else touch marker; echo unauthorized >&2; exit 2; fi",
        );
        write_tasks(
            dir.path(),
            "p",
            &TaskList {
                tasks: vec![agent("a"), script(&fatal, 5)],
                ..Default::default()
            },
        );

        let code = executor(dir.path()).run("p").unwrap();
        assert_eq!(code, EXIT_ABORT);

        // The parent was invoked with the permanent-failure instruction.
        let calls = std::fs::read_to_string(dir.path().join("takt_calls.log")).unwrap();
        assert!(calls.contains("ABORTED"), "calls:\n{calls}");
        assert!(calls.contains("unauthorized"), "calls:\n{calls}");
    }

    #[test]
    fn script_only_pipeline_retries_without_agent() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = write_script(
            dir.path(),
            "flaky.sh",
            "if [ -f marker ]; then exit 0; else touch marker; exit 1; fi",
        );
        write_tasks(
            dir.path(),
            "p",
            &TaskList {
                tasks: vec![script(&flaky, 1)],
                ..Default::default()
            },
        );

        let code = executor(dir.path()).run("p").unwrap();
        assert_eq!(code, EXIT_SUCCESS);
        // No child sessions: the parent gets the "none created" instruction.
        let calls = std::fs::read_to_string(dir.path().join("takt_calls.log")).unwrap();
        assert!(calls.contains("No child sessions were created"), "calls:\n{calls}");
    }

    #[test]
    fn parent_invocation_lists_child_ids_on_success() {
        let dir = tempfile::tempdir().unwrap();
        write_tasks(
            dir.path(),
            "p",
            &TaskList {
                tasks: vec![agent("a")],
                ..Default::default()
            },
        );
        executor(dir.path()).run("p").unwrap();
        let calls = std::fs::read_to_string(dir.path().join("takt_calls.log")).unwrap();
        assert!(calls.contains("get_sessions_final_turns"), "calls:\n{calls}");
        assert!(calls.contains("parent1/child-aaaa"), "calls:\n{calls}");
    }

    #[test]
    fn extract_session_id_finds_json_line() {
        let stdout = "some log noise\n{\"session_id\": \"abc/def\"}\n";
        assert_eq!(extract_session_id(stdout).as_deref(), Some("abc/def"));
        assert_eq!(extract_session_id("no json here"), None);
    }

    #[test]
    fn preview_keeps_tail_of_long_output() {
        let long = "x".repeat(OUTPUT_PREVIEW_BYTES * 2);
        let p = preview(&long);
        assert!(p.len() <= OUTPUT_PREVIEW_BYTES + '…'.len_utf8());
        assert!(p.starts_with('…'));
    }
}
