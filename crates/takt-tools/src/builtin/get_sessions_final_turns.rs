// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use takt_session::Turn;

use crate::{Tool, ToolContext};

/// Lets a parent session read the final model responses of its children,
/// typically after a serial pipeline announces their ids.
pub struct GetSessionsFinalTurnsTool;

#[async_trait]
impl Tool for GetSessionsFinalTurnsTool {
    fn name(&self) -> &str {
        "get_sessions_final_turns"
    }

    fn description(&self) -> &str {
        "Returns the final model response of each listed session. Use this to \
         collect the results of delegated child sessions."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_ids": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Session ids to read"
                }
            },
            "required": ["session_ids"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let Some(ids) = args.get("session_ids").and_then(|v| v.as_array()) else {
            return Ok(json!({"error": "missing required parameter 'session_ids'"}));
        };

        let mut results = Map::new();
        for id in ids.iter().filter_map(|v| v.as_str()) {
            let entry = match ctx.sessions.get_session(id) {
                Ok(Some(session)) => {
                    let final_turn = session.turns.iter().rev().find_map(|t| match t {
                        Turn::ModelResponse { content, .. } => Some(content.clone()),
                        _ => None,
                    });
                    match final_turn {
                        Some(content) => json!(content),
                        None => json!({"error": "session has no model response yet"}),
                    }
                }
                Ok(None) => json!({"error": "session not found"}),
                Err(e) => json!({"error": e.to_string()}),
            };
            results.insert(id.to_string(), entry);
        }

        Ok(json!({
            "message": Value::Object(results.clone()),
            "results": Value::Object(results),
        }))
    }
}
