// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use takt_config::Settings;
use takt_model::{ModelClient, StreamEvent, UsageMetadata};
use takt_session::{SessionService, StoreError, StreamingLog, Turn};

use crate::events::AgentEvent;
use crate::executor::ToolExecutor;
use crate::payload::PayloadService;

pub const EMPTY_STREAM_TEXT: &str = "API Error: Model stream was empty.";
pub const THOUGHTS_ONLY_TEXT: &str =
    "API Error: Model generated thoughts only; no final response was produced.";
pub const TOOL_LIMIT_TEXT: &str =
    "Error: Maximum number of tool calls reached. Halting execution.";

/// The result of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub final_text: String,
    /// Observable cost of the invocation: the last round's total tokens minus
    /// whatever the cache newly absorbed. Display-only; never stored.
    pub token_count: u64,
    /// Turns to append to the session (the aggregated `model_response`).
    pub turns: Vec<Turn>,
    pub thought_text: String,
}

/// One round accumulated from a model stream.
#[derive(Default)]
struct StreamRound {
    text: String,
    thought: String,
    function_call: Option<(String, Value)>,
    usage: Option<UsageMetadata>,
    frames: Vec<Value>,
}

impl StreamRound {
    fn is_empty(&self) -> bool {
        self.usage.is_none()
            && self.text.is_empty()
            && self.function_call.is_none()
            && self.thought.is_empty()
    }

    fn raw_json(&self) -> Option<String> {
        if self.frames.is_empty() {
            None
        } else {
            serde_json::to_string(&self.frames).ok()
        }
    }
}

/// Drives one agent invocation: a bounded tool-call loop that merges the
/// pool, builds a cache-aware request, consumes the model stream, executes
/// tool calls, and accounts for tokens.
pub struct StreamingAgent {
    sessions: Arc<SessionService>,
    client: Arc<dyn ModelClient>,
    executor: ToolExecutor,
    payload: PayloadService,
    settings: Arc<Settings>,
}

impl StreamingAgent {
    pub fn new(
        sessions: Arc<SessionService>,
        client: Arc<dyn ModelClient>,
        executor: ToolExecutor,
        payload: PayloadService,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            sessions,
            client,
            executor,
            payload,
            settings,
        }
    }

    /// Run the loop for `session_id`, emitting [`AgentEvent`]s as the stream
    /// progresses. The final `model_response` turn is returned in the outcome
    /// for the caller to append and merge.
    pub async fn run(
        &mut self,
        session_id: &str,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<AgentOutcome> {
        let max_tool_calls = self.settings.max_tool_calls;
        let mut tool_call_count = 0u32;
        let mut final_text = String::new();
        let mut thought_text = String::new();
        let mut final_raw: Option<String> = None;

        // Counters before this invocation; the observable cost subtracts the
        // cache reuse that was already in effect.
        let initial = self
            .sessions
            .get_session(session_id)?
            .ok_or_else(|| StoreError::NotFound {
                id: session_id.to_string(),
            })?;
        let cached_before = initial.cached_content_token_count;
        self.payload.seed_from_session(&initial);

        let mut prompt_tokens_prev: u64 = 0;
        let mut first_cached: Option<u64> = None;
        let mut last_usage: Option<UsageMetadata> = None;

        let stream_log =
            StreamingLog::new(self.sessions.repository().sessions_dir(), session_id);

        loop {
            // Make previous tool executions visible to the model, then reload
            // to pick up external mutations.
            self.sessions.merge_pool_into_turns(session_id)?;
            if prompt_tokens_prev > 0 {
                self.sessions
                    .update_token_count(session_id, prompt_tokens_prev)?;
            }
            let session = self
                .sessions
                .get_session(session_id)?
                .ok_or_else(|| StoreError::NotFound {
                    id: session_id.to_string(),
                })?;

            let request = self.payload.prepare_request(&session, None).await?;
            let stream = self.client.stream_generate(request).await?;
            let round = self.consume_stream(stream, &stream_log, &tx).await?;

            if round.is_empty() {
                final_text = EMPTY_STREAM_TEXT.to_string();
                let _ = tx.send(AgentEvent::TextDelta(final_text.clone())).await;
                break;
            }

            if let Some(usage) = round.usage {
                prompt_tokens_prev = usage.prompt_token_count;
                last_usage = Some(usage);
                self.payload
                    .record_usage(usage.prompt_token_count, usage.cached_content_token_count);
                // The cached count is taken from the first response of the
                // invocation and persisted right away so subsequent cache
                // decisions in this loop see it.
                if first_cached.is_none() {
                    first_cached = Some(usage.cached_content_token_count);
                    self.sessions.update_cached_content_token_count(
                        session_id,
                        usage.cached_content_token_count,
                    )?;
                }
                let _ = tx
                    .send(AgentEvent::Usage {
                        prompt_tokens: usage.prompt_token_count,
                        candidates_tokens: usage.candidates_token_count,
                        total_tokens: usage.total_token_count,
                        cached_tokens: usage.cached_content_token_count,
                    })
                    .await;
            }

            thought_text.push_str(&round.thought);

            let Some((name, args)) = round.function_call.clone() else {
                if round.text.is_empty() && !round.thought.is_empty() {
                    // Counters above are already written; only the text is
                    // substituted.
                    final_text = THOUGHTS_ONLY_TEXT.to_string();
                    let _ = tx.send(AgentEvent::TextDelta(final_text.clone())).await;
                } else {
                    final_text = round.text.clone();
                    final_raw = round.raw_json();
                }
                break;
            };

            if tool_call_count >= max_tool_calls {
                warn!(max_tool_calls, "tool-call cap reached");
                final_text = TOOL_LIMIT_TEXT.to_string();
                let _ = tx.send(AgentEvent::TextDelta(final_text.clone())).await;
                break;
            }
            tool_call_count += 1;

            let call_display = format!(
                "```\nTool call: {name}\nArgs:\n{}\n```\n",
                serde_json::to_string_pretty(&args).unwrap_or_default()
            );
            let _ = tx
                .send(AgentEvent::ToolCallStarted {
                    name: name.clone(),
                    args: args.clone(),
                    display: call_display,
                })
                .await;

            let (_, payload) = self.executor.execute(session_id, &name, &args).await;

            // Preserve this round's frames on the pooled function_calling
            // turn so the next request can restore thought signatures.
            if let Some(raw) = round.raw_json() {
                self.sessions
                    .set_raw_response_on_last_call(session_id, &raw)?;
            }

            let status_display = format!(
                "```\nTool status: {}\n```\n",
                serde_json::to_value(payload.status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            );
            let _ = tx
                .send(AgentEvent::ToolCallFinished {
                    name,
                    status: payload.status,
                    display: status_display,
                })
                .await;
        }

        // Write the counters back at the end of the invocation: the prompt
        // count for cache decisions, the first response's cached count.
        if prompt_tokens_prev > 0 {
            self.sessions
                .update_token_count(session_id, prompt_tokens_prev)?;
            if let Some(cached) = first_cached {
                self.sessions
                    .update_cached_content_token_count(session_id, cached)?;
            }
        }

        let token_count = last_usage
            .map(|u| {
                u.total_token_count
                    .saturating_sub(u.cached_content_token_count.saturating_sub(cached_before))
            })
            .unwrap_or(0);

        stream_log.cleanup();
        let _ = tx.send(AgentEvent::TurnComplete).await;

        debug!(session_id, token_count, tool_call_count, "invocation finished");

        Ok(AgentOutcome {
            final_text: final_text.clone(),
            token_count,
            turns: vec![Turn::ModelResponse {
                content: final_text,
                timestamp: self.sessions.now_timestamp(),
                raw_response: final_raw,
            }],
            thought_text,
        })
    }

    async fn consume_stream(
        &self,
        mut stream: takt_model::ChunkStream,
        stream_log: &StreamingLog,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<StreamRound> {
        let mut round = StreamRound::default();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Text { content, thought } if !content.is_empty() => {
                    if thought {
                        round.thought.push_str(&content);
                        let _ = tx.send(AgentEvent::ThoughtDelta(content)).await;
                    } else {
                        round.text.push_str(&content);
                        let _ = tx.send(AgentEvent::TextDelta(content)).await;
                    }
                }
                StreamEvent::Text { .. } => {}
                StreamEvent::FunctionCall { name, args } => {
                    if round.function_call.is_none() {
                        round.function_call = Some((name, args));
                    } else {
                        warn!(tool = %name, "ignoring additional function call in the same round");
                    }
                }
                StreamEvent::Usage(usage) => round.usage = Some(usage),
                StreamEvent::Frame(frame) => {
                    stream_log.append(
                        "RAW_CHUNK",
                        &frame.to_string(),
                        &self.sessions.now_timestamp(),
                    );
                    round.frames.push(frame);
                }
                StreamEvent::Done => break,
            }
        }
        Ok(round)
    }
}
