// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use takt_model::{ContentPart, ContentRecord, ContentRole, RawFrame};
use takt_session::{Session, Turn};

/// The three request layers produced from one session + instruction:
/// cacheable static identity, never-cached dynamic context, and the buffered
/// history with the current instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub static_content: String,
    pub dynamic_content: String,
    pub buffered_history: Vec<ContentRecord>,
    pub current_task: Option<ContentRecord>,
}

impl AssembledPrompt {
    /// The ordered content list for the model request: dynamic context,
    /// buffered history, then the current instruction. Static content is
    /// carried separately so the caller can omit it when a cache holds it.
    pub fn contents(&self) -> Vec<ContentRecord> {
        let mut contents = Vec::with_capacity(self.buffered_history.len() + 2);
        if !self.dynamic_content.is_empty() {
            contents.push(ContentRecord::user_text(self.dynamic_content.clone()));
        }
        contents.extend(self.buffered_history.iter().cloned());
        if let Some(task) = &self.current_task {
            contents.push(task.clone());
        }
        contents
    }

    /// Flat text rendering for `--dry-run`.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.static_content);
        out.push('\n');
        out.push_str(&self.dynamic_content);
        for record in &self.buffered_history {
            out.push('\n');
            for part in &record.parts {
                match part {
                    ContentPart::Text { text, .. } => out.push_str(text),
                    ContentPart::FunctionCall { name, args, .. } => {
                        let _ = write!(out, "Function Call: {name}({args})");
                    }
                    ContentPart::FunctionResponse { name, response } => {
                        let _ = write!(out, "Function Response ({name}): {response}");
                    }
                }
            }
        }
        if let Some(task) = &self.current_task {
            for part in &task.parts {
                if let ContentPart::Text { text, .. } = part {
                    out.push('\n');
                    out.push_str(text);
                }
            }
        }
        out
    }

    /// Character-based token estimate for the pre-flight context check.
    pub fn estimated_tokens(&self) -> u64 {
        let chars = self.static_content.len()
            + self.dynamic_content.len()
            + self
                .buffered_history
                .iter()
                .chain(self.current_task.iter())
                .map(record_chars)
                .sum::<usize>();
        (chars / 4) as u64
    }
}

fn record_chars(record: &ContentRecord) -> usize {
    record
        .parts
        .iter()
        .map(|p| match p {
            ContentPart::Text { text, .. } => text.len(),
            ContentPart::FunctionCall { name, args, .. } => name.len() + args.to_string().len(),
            ContentPart::FunctionResponse { name, response } => {
                name.len() + response.to_string().len()
            }
        })
        .sum()
}

/// Builds the layered request content from a session. Pure: the same session,
/// instruction, and timestamp produce the same output, and pool entries are
/// invisible until merged into turns.
pub struct PromptAssembler {
    project_root: PathBuf,
}

impl PromptAssembler {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Assemble the three layers. `now` is the pre-formatted current
    /// datetime; `cached_turn_count` is taken from the session.
    pub fn assemble(
        &self,
        session: &Session,
        instruction: Option<&str>,
        now: &str,
    ) -> AssembledPrompt {
        let cached = session.cached_turn_count.min(session.turns.len());

        AssembledPrompt {
            static_content: self.render_static(session, cached),
            dynamic_content: self.render_dynamic(session, now),
            buffered_history: session.turns[cached..]
                .iter()
                .map(turn_to_content)
                .collect(),
            current_task: instruction.map(ContentRecord::user_text),
        }
    }

    // ── Layer 1: static identity ──────────────────────────────────────────────

    fn render_static(&self, session: &Session, cached_turn_count: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Agent Session");
        let _ = writeln!(out);
        let _ = writeln!(out, "## Identity");
        let _ = writeln!(out, "- Session ID: {}", session.session_id);
        let _ = writeln!(out, "- Created At: {}", session.created_at);
        let _ = writeln!(out);
        let _ = writeln!(out, "## Purpose");
        let _ = writeln!(out, "{}", session.purpose);
        let _ = writeln!(out);
        let _ = writeln!(out, "## Background");
        let _ = writeln!(out, "{}", session.background);

        for role in &session.roles {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Role: {role}");
            let _ = writeln!(out, "{}", self.read_document(role));
        }

        if let Some(procedure) = &session.procedure {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Procedure: {procedure}");
            let _ = writeln!(out, "{}", self.read_document(procedure));
        }

        if cached_turn_count > 0 {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Conversation History");
            for turn in &session.turns[..cached_turn_count] {
                let _ = writeln!(out, "{}", render_turn_text(turn));
            }
        }

        out
    }

    // ── Layer 2: dynamic context ──────────────────────────────────────────────

    fn render_dynamic(&self, session: &Session, now: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "## Current Context");
        let _ = writeln!(out, "- Current Datetime: {now}");

        let active_references: Vec<_> =
            session.references.iter().filter(|r| !r.disabled).collect();
        if !active_references.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## File References");
            for reference in active_references {
                let _ = writeln!(out);
                let _ = writeln!(out, "### {}", reference.path);
                let _ = writeln!(out, "{}", self.read_document(&reference.path));
            }
        }

        if let Some(todos) = session.todos.as_deref().filter(|t| !t.is_empty()) {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Todos");
            for todo in todos {
                let mark = if todo.checked { "x" } else { " " };
                if todo.description.is_empty() {
                    let _ = writeln!(out, "- [{mark}] {}", todo.title);
                } else {
                    let _ = writeln!(out, "- [{mark}] {}: {}", todo.title, todo.description);
                }
            }
        }

        if !session.artifacts.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Artifacts");
            for artifact in &session.artifacts {
                let _ = writeln!(out);
                let _ = writeln!(out, "### {artifact}");
                let _ = writeln!(out, "{}", self.read_document(artifact));
            }
        }

        out
    }

    fn read_document(&self, path: &str) -> String {
        let resolved = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.project_root.join(path)
        };
        match std::fs::read_to_string(&resolved) {
            Ok(content) => content,
            Err(_) => format!("(unreadable: {path})"),
        }
    }
}

// ── Layer 3: buffered history conversion ──────────────────────────────────────

fn turn_to_content(turn: &Turn) -> ContentRecord {
    match turn {
        Turn::UserTask { instruction, .. } => ContentRecord::user_text(instruction.clone()),
        Turn::ModelResponse {
            content,
            raw_response,
            ..
        } => restore_thought_signature(raw_response.as_deref())
            .unwrap_or_else(|| ContentRecord::model_text(content.clone())),
        Turn::FunctionCalling {
            response,
            raw_response,
            ..
        } => restore_thought_signature(raw_response.as_deref())
            .unwrap_or_else(|| ContentRecord::model_text(format!("Function Call: {response}"))),
        Turn::ToolResponse { name, response, .. } => ContentRecord {
            role: ContentRole::User,
            parts: vec![ContentPart::FunctionResponse {
                name: name.clone(),
                response: serde_json::to_value(response).unwrap_or_default(),
            }],
        },
        Turn::CompressedHistory { content, .. } => ContentRecord::user_text(content.clone()),
    }
}

/// Rebuild a content record from persisted raw frames, preserving the
/// thought-signature discriminator. The raw value is a JSON array of frames
/// (one per streamed chunk); the last frame carrying a signature wins. A
/// single-object raw (older sessions) is restored wholesale.
fn restore_thought_signature(raw: Option<&str>) -> Option<ContentRecord> {
    let raw = raw?;

    if let Ok(frames) = serde_json::from_str::<Vec<RawFrame>>(raw) {
        let frame = frames.iter().rev().find(|f| f.has_thought_signature())?;
        return frame_to_record(frame);
    }
    if let Ok(frame) = serde_json::from_str::<RawFrame>(raw) {
        return frame_to_record(&frame);
    }
    None
}

fn frame_to_record(frame: &RawFrame) -> Option<ContentRecord> {
    let mut parts = Vec::new();
    for raw_part in &frame.parts {
        if let Some(text) = &raw_part.text {
            parts.push(ContentPart::Text {
                text: text.clone(),
                thought: raw_part.thought,
                thought_signature: raw_part.thought_signature.clone(),
            });
        }
        if let Some(fc) = &raw_part.function_call {
            parts.push(ContentPart::FunctionCall {
                name: fc.name.clone(),
                args: fc.args.clone(),
                thought_signature: raw_part.thought_signature.clone(),
            });
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(ContentRecord {
        role: ContentRole::Model,
        parts,
    })
}

fn render_turn_text(turn: &Turn) -> String {
    match turn {
        Turn::UserTask { instruction, .. } => format!("[user] {instruction}"),
        Turn::ModelResponse { content, .. } => format!("[model] {content}"),
        Turn::FunctionCalling { response, .. } => format!("[model] Function Call: {response}"),
        Turn::ToolResponse { name, response, .. } => format!(
            "[tool:{name}] {}",
            serde_json::to_string(response).unwrap_or_default()
        ),
        Turn::CompressedHistory {
            content,
            original_turns_range: (lo, hi),
            ..
        } => format!("[summary of turns {lo}-{hi}] {content}"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
