use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use takt_config::Hyperparameters;

/// One entry in the conversation log. The `type` discriminator is stored on
/// disk so session files remain readable by external tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Turn {
    UserTask {
        instruction: String,
        timestamp: String,
    },
    ModelResponse {
        content: String,
        timestamp: String,
        /// Opaque JSON preserving the streamed frames, used to restore
        /// thought-signature parts on the next request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_response: Option<String>,
    },
    FunctionCalling {
        /// Display string of the call, e.g. `read_file({"file_path": "x"})`.
        response: String,
        timestamp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_response: Option<String>,
    },
    ToolResponse {
        name: String,
        response: ToolResponsePayload,
        timestamp: String,
    },
    CompressedHistory {
        content: String,
        /// 1-based inclusive range of the turns this summary replaced.
        original_turns_range: (u64, u64),
        timestamp: String,
    },
}

impl Turn {
    pub fn type_name(&self) -> &'static str {
        match self {
            Turn::UserTask { .. } => "user_task",
            Turn::ModelResponse { .. } => "model_response",
            Turn::FunctionCalling { .. } => "function_calling",
            Turn::ToolResponse { .. } => "tool_response",
            Turn::CompressedHistory { .. } => "compressed_history",
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            Turn::UserTask { timestamp, .. }
            | Turn::ModelResponse { timestamp, .. }
            | Turn::FunctionCalling { timestamp, .. }
            | Turn::ToolResponse { timestamp, .. }
            | Turn::CompressedHistory { timestamp, .. } => timestamp,
        }
    }

    pub fn is_model_response(&self) -> bool {
        matches!(self, Turn::ModelResponse { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Succeeded,
    Failed,
}

/// The normalized result of a tool execution as recorded on the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponsePayload {
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub message: Value,
    /// Any additional keys the tool returned besides error/message.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ToolResponsePayload {
    pub fn succeeded(message: impl Into<Value>) -> Self {
        Self {
            status: ToolStatus::Succeeded,
            message: message.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn failed(message: impl Into<Value>) -> Self {
        Self {
            status: ToolStatus::Failed,
            message: message.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// A file the agent should treat as context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub path: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(default)]
    pub persist: bool,
}

impl Reference {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            disabled: false,
            ttl: None,
            persist: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub checked: bool,
}

/// The session aggregate. Everything the runtime knows about one agent
/// conversation lives in this record; the repository persists it as a single
/// JSON document under the session's lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Hierarchical id: a root session is a hex hash, a child is
    /// `parent_id/hash`. The on-disk path mirrors the hierarchy.
    pub session_id: String,
    pub created_at: String,
    pub purpose: String,
    pub background: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub multi_step_reasoning_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure: Option<String>,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todos: Option<Vec<TodoItem>>,
    #[serde(default)]
    pub turns: Vec<Turn>,
    /// Turns written out-of-band by tool executions since the last merge.
    #[serde(default)]
    pub pools: Vec<Turn>,
    /// The last observed *prompt* token count; feeds cache decisions.
    #[serde(default)]
    pub token_count: u64,
    /// Tokens already absorbed by the remote cache, from the first chunk of
    /// the last response.
    #[serde(default)]
    pub cached_content_token_count: u64,
    /// Count of the leading turns considered immutable and cacheable.
    /// Monotonic; never reaches the tail turn.
    #[serde(default)]
    pub cached_turn_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperparameters: Option<Hyperparameters>,
}

// ─── Index ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOverview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub last_updated: String,
}

/// The single index file kept in sync with the session files; all mutations
/// go through the index lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionIndex {
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionOverview>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
