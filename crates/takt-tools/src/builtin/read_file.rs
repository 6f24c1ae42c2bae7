// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::require_str;
use crate::{Tool, ToolContext};

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads a text file and returns its content. \
         Use 'offset' (1-based line number) and 'limit' to read a window of a \
         large file instead of the whole thing."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute or project-relative path to the file"
                },
                "offset": {
                    "type": "number",
                    "description": "1-based line to start reading from (optional)"
                },
                "limit": {
                    "type": "number",
                    "description": "Maximum number of lines to return (optional)"
                }
            },
            "required": ["file_path"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let path = match require_str(args, "file_path") {
            Ok(p) => p,
            Err(e) => return Ok(e),
        };
        let resolved = if std::path::Path::new(path).is_absolute() {
            std::path::PathBuf::from(path)
        } else {
            ctx.project_root.join(path)
        };

        let content = match tokio::fs::read_to_string(&resolved).await {
            Ok(c) => c,
            Err(e) => {
                return Ok(json!({
                    "error": format!("could not read {}: {e}", resolved.display())
                }))
            }
        };

        let offset = args.get("offset").and_then(|v| v.as_u64());
        let limit = args.get("limit").and_then(|v| v.as_u64());
        let (content, total_lines) = match (offset, limit) {
            (None, None) => {
                let total = content.lines().count();
                (content, total)
            }
            (offset, limit) => {
                let lines: Vec<&str> = content.lines().collect();
                let total = lines.len();
                let start = offset.map(|o| o.saturating_sub(1) as usize).unwrap_or(0);
                let take = limit.map(|l| l as usize).unwrap_or(usize::MAX);
                let window: Vec<&str> = lines.into_iter().skip(start).take(take).collect();
                (window.join("\n"), total)
            }
        };

        Ok(json!({
            "message": content,
            "total_lines": total_lines,
        }))
    }
}
