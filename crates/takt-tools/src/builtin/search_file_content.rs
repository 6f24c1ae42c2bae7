// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::tool::require_str;
use crate::{Tool, ToolContext};

/// Matches beyond this count are dropped; the model rarely needs more.
const MATCH_CAP: usize = 100;

pub struct SearchFileContentTool;

#[async_trait]
impl Tool for SearchFileContentTool {
    fn name(&self) -> &str {
        "search_file_content"
    }

    fn description(&self) -> &str {
        "Searches file contents under a directory with a regular expression. \
         Returns up to 100 matches as 'path:line: text'. Use 'include' to \
         restrict the search to files whose name contains a substring."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search (optional, defaults to the project root)"
                },
                "include": {
                    "type": "string",
                    "description": "Only search files whose name contains this substring (optional)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let pattern = match require_str(args, "pattern") {
            Ok(p) => p,
            Err(e) => return Ok(e),
        };
        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return Ok(json!({"error": format!("invalid pattern: {e}")})),
        };
        let root = args
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| {
                if std::path::Path::new(p).is_absolute() {
                    std::path::PathBuf::from(p)
                } else {
                    ctx.project_root.join(p)
                }
            })
            .unwrap_or_else(|| ctx.project_root.clone());
        let include = args.get("include").and_then(|v| v.as_str());

        let mut matches = Vec::new();
        let mut truncated = false;

        'walk: for entry in WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| !is_hidden(e))
            .flatten()
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(needle) = include {
                if !entry.file_name().to_string_lossy().contains(needle) {
                    continue;
                }
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue; // binary or unreadable
            };
            for (line_no, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    let rel = entry
                        .path()
                        .strip_prefix(&root)
                        .unwrap_or(entry.path())
                        .display();
                    matches.push(format!("{rel}:{}: {}", line_no + 1, line.trim_end()));
                    if matches.len() >= MATCH_CAP {
                        truncated = true;
                        break 'walk;
                    }
                }
            }
        }

        let mut message = matches.join("\n");
        if truncated {
            message.push_str("\n… [match limit reached]");
        }
        if matches.is_empty() {
            message = format!("no matches for /{pattern}/");
        }

        Ok(json!({
            "message": message,
            "match_count": matches.len(),
        }))
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}
