// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use takt_session::ToolStatus;

/// Events emitted by the agent during a single invocation. Consumers (the
/// CLI, the serial executor's captured stdout) subscribe to these to drive
/// their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model.
    TextDelta(String),
    /// A reasoning chunk from the model; never part of the final response.
    ThoughtDelta(String),
    /// The model has requested a tool call. `display` is the synthetic
    /// markdown block announcing it on the stream.
    ToolCallStarted {
        name: String,
        args: Value,
        display: String,
    },
    /// A tool call finished; `display` announces the normalized status.
    ToolCallFinished {
        name: String,
        status: ToolStatus,
        display: String,
    },
    /// Usage counts from the last chunk of a streaming round.
    Usage {
        prompt_tokens: u64,
        candidates_tokens: u64,
        total_tokens: u64,
        cached_tokens: u64,
    },
    /// The invocation is complete.
    TurnComplete,
}
