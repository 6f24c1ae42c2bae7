// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::require_str;
use crate::{Tool, ToolContext};

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Writes content to a file, overwriting any existing content. \
         Creates parent directories automatically."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute or project-relative path to the file"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                }
            },
            "required": ["file_path", "content"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let path = match require_str(args, "file_path") {
            Ok(p) => p,
            Err(e) => return Ok(e),
        };
        let content = match require_str(args, "content") {
            Ok(c) => c,
            Err(e) => return Ok(e),
        };
        let resolved = if std::path::Path::new(path).is_absolute() {
            std::path::PathBuf::from(path)
        } else {
            ctx.project_root.join(path)
        };

        debug!(path = %resolved.display(), bytes = content.len(), "write_file");

        if let Some(parent) = resolved.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return Ok(json!({
                        "error": format!("could not create {}: {e}", parent.display())
                    }));
                }
            }
        }

        match tokio::fs::write(&resolved, content).await {
            Ok(()) => Ok(json!({
                "message": format!("wrote {} bytes to {}", content.len(), resolved.display())
            })),
            Err(e) => Ok(json!({
                "error": format!("could not write {}: {e}", resolved.display())
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testutil::context_with_session;

    #[tokio::test]
    async fn writes_and_creates_parent_dirs() {
        let (dir, ctx, _) = context_with_session();
        let path = dir.path().join("nested/dir/out.txt");

        let out = WriteFileTool
            .execute(
                &json!({"file_path": path.to_string_lossy(), "content": "payload"}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.get("error").is_none(), "{out}");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "payload");
    }

    #[tokio::test]
    async fn missing_content_is_an_error() {
        let (dir, ctx, _) = context_with_session();
        let path = dir.path().join("x.txt");
        let out = WriteFileTool
            .execute(&json!({"file_path": path.to_string_lossy()}), &ctx)
            .await
            .unwrap();
        assert!(out["error"].as_str().unwrap().contains("'content'"));
    }

    #[tokio::test]
    async fn overwrites_existing_file() {
        let (dir, ctx, _) = context_with_session();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, "old").unwrap();
        WriteFileTool
            .execute(
                &json!({"file_path": path.to_string_lossy(), "content": "new"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }
}
