// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use takt_pipeline::todos_file;
use takt_session::TodoItem;

use crate::{Tool, ToolContext};

pub struct UpdateTodosTool;

#[async_trait]
impl Tool for UpdateTodosTool {
    fn name(&self) -> &str {
        "update_todos"
    }

    fn description(&self) -> &str {
        "Replaces the session's todo list. Each todo has a title, an optional \
         description, and a checked flag. Pass an empty list to clear."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": {"type": "string"},
                            "description": {"type": "string"},
                            "checked": {"type": "boolean"}
                        },
                        "required": ["title"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let Some(session_id) = ctx.session_id_or_env() else {
            return Ok(json!({"error": "no active session for update_todos"}));
        };
        let todos: Vec<TodoItem> = match args.get("todos") {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(todos) => todos,
                Err(e) => return Ok(json!({"error": format!("invalid todos: {e}")})),
            },
            None => return Ok(json!({"error": "missing required parameter 'todos'"})),
        };

        if let Err(e) = ctx.sessions.update_todos(&session_id, todos.clone()) {
            return Ok(json!({"error": e.to_string()}));
        }

        // Mirror for external orchestrators; failure here is not the tool's.
        let mirror = todos_file(&ctx.project_root, &session_id);
        let write_mirror = || -> std::io::Result<()> {
            if let Some(parent) = mirror.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&mirror, serde_json::to_string_pretty(&todos)?)
        };
        if let Err(e) = write_mirror() {
            debug!(path = %mirror.display(), error = %e, "todos mirror write failed");
        }

        Ok(json!({
            "message": format!("todo list updated ({} items)", todos.len())
        }))
    }
}
