// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use takt_config::Settings;
use takt_session::SessionService;

/// Shared state threaded through every tool invocation instead of globals:
/// the session store handle, the active session id, settings, and the project
/// root. Tools that record turns do so via `sessions`, scoped by
/// `session_id`.
#[derive(Clone)]
pub struct ToolContext {
    pub sessions: Arc<SessionService>,
    /// The session on whose behalf the tool runs. `None` only for tools
    /// invoked outside any session.
    pub session_id: Option<String>,
    pub settings: Arc<Settings>,
    pub project_root: PathBuf,
}

impl ToolContext {
    /// The active session id, falling back to the environment hint left by a
    /// spawning process. The variable is a last resort, not truth.
    pub fn session_id_or_env(&self) -> Option<String> {
        self.session_id
            .clone()
            .or_else(|| std::env::var("TAKT_SESSION_ID").ok())
    }
}

/// Trait every builtin tool implements.
///
/// Tools return a JSON object. A mapping with a non-empty `error` key marks
/// failure; everything else counts as success, with `message` (or `content`)
/// as the human-readable result. The executor performs that normalization —
/// tools just report what happened.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Execute the tool. Prefer returning `{"error": …}` over `Err` for
    /// expected failures; both end up as a failed tool response.
    async fn execute(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<Value>;
}

/// Read a required string argument, as `Ok`, or a ready-made error object.
pub(crate) fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, Value> {
    match args.get(key).and_then(|v| v.as_str()) {
        Some(s) => Ok(s),
        None => Err(serde_json::json!({
            "error": format!("missing required parameter '{key}'")
        })),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn require_str_extracts_present_key() {
        let args = json!({"path": "/tmp/x"});
        assert_eq!(require_str(&args, "path").unwrap(), "/tmp/x");
    }

    #[test]
    fn require_str_reports_missing_key() {
        let args = json!({});
        let err = require_str(&args, "path").unwrap_err();
        assert!(err["error"].as_str().unwrap().contains("'path'"));
    }

    #[test]
    fn require_str_rejects_non_string() {
        let args = json!({"path": 42});
        assert!(require_str(&args, "path").is_err());
    }
}
