use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Request content types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentRole {
    User,
    Model,
}

/// A single part of a content record.
///
/// Thought parts carry the provider's opaque `thought_signature` so that a
/// reasoning chain interrupted by a tool call can be resumed on the next
/// request. Parts without a signature round-trip as plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        thought: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    FunctionCall {
        name: String,
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    FunctionResponse {
        name: String,
        response: Value,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            thought: false,
            thought_signature: None,
        }
    }
}

/// One turn of request content: a role plus its ordered parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub role: ContentRole,
    pub parts: Vec<ContentPart>,
}

impl ContentRecord {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: ContentRole::User,
            parts: vec![ContentPart::text(text)],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: ContentRole::Model,
            parts: vec![ContentPart::text(text)],
        }
    }
}

/// A tool definition advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

/// Sampling configuration resolved from settings + session overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

/// A fully prepared model request.
///
/// `static_content` is `None` when a remote cache already carries the static
/// layer; `cache_name` then names that cache. Tool definitions are likewise
/// omitted when a cache carries them.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub static_content: Option<String>,
    pub contents: Vec<ContentRecord>,
    pub tools: Vec<ToolSchema>,
    pub generation: GenerationConfig,
    pub cache_name: Option<String>,
}

// ─── Stream events ────────────────────────────────────────────────────────────

/// Usage metadata reported on the final chunk of a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
    #[serde(default)]
    pub cached_content_token_count: u64,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text delta. `thought` marks reasoning output that must not be
    /// surfaced as the final response.
    Text { content: String, thought: bool },
    /// The model wants to call a tool.
    FunctionCall { name: String, args: Value },
    /// Usage statistics, carried by the final chunk.
    Usage(UsageMetadata),
    /// The raw chunk exactly as received, forwarded so the caller can
    /// persist it for thought-signature restoration.
    Frame(Value),
    /// The stream finished normally.
    Done,
}

// ─── Raw response frames ──────────────────────────────────────────────────────

/// The shape a persisted `raw_response` parses into: an array of frames, each
/// holding ordered parts. Kept opaque as a JSON string everywhere except the
/// prompt assembler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    #[serde(default)]
    pub parts: Vec<RawPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thought: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<RawFunctionCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl RawFrame {
    /// True when any part of this frame carries a thought signature.
    pub fn has_thought_signature(&self) -> bool {
        self.parts.iter().any(|p| p.thought_signature.is_some())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
