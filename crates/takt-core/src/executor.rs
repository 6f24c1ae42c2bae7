// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use takt_session::{SessionService, ToolResponsePayload, ToolStatus, Turn};
use takt_tools::{ToolContext, ToolRegistry};

/// Dispatches tool calls by name and records the call/response pair on the
/// session pool. Tool failures are data, not errors: every outcome becomes a
/// `tool_response` turn and a normalized payload, and nothing here can abort
/// the agent loop.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionService>,
    context: ToolContext,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, context: ToolContext) -> Self {
        Self {
            registry,
            sessions: context.sessions.clone(),
            context,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute `name` with `args` on behalf of `session_id`. Returns the raw
    /// tool result plus the normalized payload recorded on the pool.
    pub async fn execute(
        &self,
        session_id: &str,
        name: &str,
        args: &Value,
    ) -> (Value, ToolResponsePayload) {
        // The call is recorded before validation so the log always shows what
        // the model asked for, even when the name is bogus.
        let display = format!("{name}({args})");
        if let Err(e) = self.sessions.add_to_pool(
            session_id,
            Turn::FunctionCalling {
                response: display,
                timestamp: self.sessions.now_timestamp(),
                raw_response: None,
            },
        ) {
            warn!(error = %e, "failed to record function_calling turn");
        }

        let raw = self.run_tool(session_id, name, args).await;
        let payload = normalize(&raw);

        if let Err(e) = self.sessions.add_to_pool(
            session_id,
            Turn::ToolResponse {
                name: name.to_string(),
                response: payload.clone(),
                timestamp: self.sessions.now_timestamp(),
            },
        ) {
            warn!(error = %e, "failed to record tool_response turn");
        }

        (raw, payload)
    }

    async fn run_tool(&self, session_id: &str, name: &str, args: &Value) -> Value {
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return json!({"error": format!("invalid tool name: {name}")});
        }
        let Some(tool) = self.registry.get(name) else {
            return json!({"error": format!("tool '{name}' not found")});
        };

        debug!(tool = name, session_id, "dispatching tool call");
        let mut ctx = self.context.clone();
        ctx.session_id = Some(session_id.to_string());

        match tool.execute(args, &ctx).await {
            Ok(value) => value,
            Err(e) => json!({"error": e.to_string()}),
        }
    }
}

/// Normalize a raw tool result into the recorded status/message form:
/// a mapping with a non-empty `error` key is failed; any other mapping is
/// succeeded with `message` (falling back to `content`, then to the whole
/// value); a non-mapping result is succeeded as-is.
pub(crate) fn normalize(raw: &Value) -> ToolResponsePayload {
    if let Some(object) = raw.as_object() {
        if let Some(error) = object.get("error") {
            let empty = error.is_null() || error.as_str().is_some_and(str::is_empty);
            if !empty {
                return ToolResponsePayload::failed(error.clone());
            }
        }

        let message = object
            .get("message")
            .or_else(|| object.get("content"))
            .cloned()
            .unwrap_or_else(|| Value::String(raw.to_string()));
        let extra: serde_json::Map<String, Value> = object
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "message" | "error" | "status"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut payload = ToolResponsePayload::succeeded(message);
        payload.extra = extra;
        return payload;
    }

    ToolResponsePayload::succeeded(raw.clone())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
