// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::tool::require_str;
use crate::{Tool, ToolContext};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

pub struct RunShellCommandTool {
    pub timeout_secs: u64,
}

impl Default for RunShellCommandTool {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

#[async_trait]
impl Tool for RunShellCommandTool {
    fn name(&self) -> &str {
        "run_shell_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout, stderr, and the exit code. \
         Prefer non-interactive commands; avoid commands that require a TTY. \
         Output is capped at ~20 KB."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The complete shell command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to the project root)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let command = match require_str(args, "command") {
            Ok(c) => c.to_string(),
            Err(e) => return Ok(e),
        };
        let cwd = args
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| ctx.project_root.clone());

        debug!(command = %command, cwd = %cwd.display(), "run_shell_command");

        let mut child = Command::new("sh");
        child.arg("-c").arg(&command).current_dir(&cwd);
        if let Some(id) = ctx.session_id_or_env() {
            child.env("TAKT_SESSION_ID", id);
        }

        let run = tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_secs),
            child.output(),
        );
        let output = match run.await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Ok(json!({"error": format!("failed to spawn command: {e}")}));
            }
            Err(_) => {
                return Ok(json!({
                    "error": format!("command timed out after {}s", self.timeout_secs)
                }));
            }
        };

        let stdout = truncate(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            Ok(json!({
                "message": stdout,
                "stderr": stderr,
                "exit_code": exit_code,
            }))
        } else {
            Ok(json!({
                "error": format!("command exited with status {exit_code}"),
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": exit_code,
            }))
        }
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= OUTPUT_LIMIT_BYTES {
        return text.to_string();
    }
    let mut end = OUTPUT_LIMIT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n… [output truncated]", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testutil::context_with_session;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let (_dir, ctx, _) = context_with_session();
        let out = RunShellCommandTool::default()
            .execute(&json!({"command": "echo hello"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["message"].as_str().unwrap().trim(), "hello");
        assert_eq!(out["exit_code"], 0);
        assert!(out.get("error").is_none());
    }

    #[tokio::test]
    async fn non_zero_exit_reports_error() {
        let (_dir, ctx, _) = context_with_session();
        let out = RunShellCommandTool::default()
            .execute(&json!({"command": "echo oops >&2; exit 3"}), &ctx)
            .await
            .unwrap();
        assert!(out["error"].as_str().unwrap().contains("status 3"));
        assert_eq!(out["stderr"].as_str().unwrap().trim(), "oops");
        assert_eq!(out["exit_code"], 3);
    }

    #[tokio::test]
    async fn runs_in_project_root_by_default() {
        let (dir, ctx, _) = context_with_session();
        let out = RunShellCommandTool::default()
            .execute(&json!({"command": "pwd"}), &ctx)
            .await
            .unwrap();
        let pwd = out["message"].as_str().unwrap().trim();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(pwd).canonicalize().unwrap(),
            root
        );
    }

    #[tokio::test]
    async fn session_id_is_exported_to_subprocess() {
        let (_dir, ctx, session_id) = context_with_session();
        let out = RunShellCommandTool::default()
            .execute(&json!({"command": "printf %s \"$TAKT_SESSION_ID\""}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["message"].as_str().unwrap(), session_id);
    }

    #[test]
    fn truncate_caps_long_output() {
        let long = "y".repeat(OUTPUT_LIMIT_BYTES * 2);
        let t = truncate(&long);
        assert!(t.len() < long.len());
        assert!(t.ends_with("[output truncated]"));
    }
}
