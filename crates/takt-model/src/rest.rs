// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    CachedContent, ChunkStream, ModelClient, ModelRequest, RawFrame, StreamEvent, ToolSchema,
    UsageMetadata,
};

/// Streaming HTTP client for providers speaking the chunked-frame contract:
/// the response body is one JSON frame per line, each frame carrying ordered
/// parts and, on the final frame, usage metadata.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    fn generate_url(&self) -> String {
        format!("{}/models/{}:streamGenerate", self.base_url, self.model)
    }

    fn cache_url(&self, name: Option<&str>) -> String {
        match name {
            Some(n) => format!("{}/{}", self.base_url, n),
            None => format!("{}/cachedContents", self.base_url),
        }
    }
}

/// Translate one wire frame into the events it carries. The raw frame itself
/// is always forwarded first so callers can persist it verbatim.
fn frame_to_events(frame: Value) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::Frame(frame.clone())];

    if let Ok(parsed) = serde_json::from_value::<RawFrame>(frame.clone()) {
        for part in parsed.parts {
            if let Some(text) = part.text {
                events.push(StreamEvent::Text {
                    content: text,
                    thought: part.thought,
                });
            }
            if let Some(fc) = part.function_call {
                events.push(StreamEvent::FunctionCall {
                    name: fc.name,
                    args: fc.args,
                });
            }
        }
    }

    if let Some(usage) = frame.get("usage_metadata") {
        if let Ok(u) = serde_json::from_value::<UsageMetadata>(usage.clone()) {
            events.push(StreamEvent::Usage(u));
        }
    }

    events
}

struct DecodeState {
    body: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    line_buf: String,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

impl DecodeState {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(frame) => self.pending.extend(frame_to_events(frame)),
                Err(e) => debug!(error = %e, "skipping undecodable stream line"),
            }
        }
    }
}

#[async_trait]
impl ModelClient for RestClient {
    fn name(&self) -> &str {
        "rest"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_generate(&self, req: ModelRequest) -> anyhow::Result<ChunkStream> {
        let mut body = json!({
            "contents": req.contents,
            "generation_config": req.generation,
        });
        if !req.tools.is_empty() {
            body["tools"] = serde_json::to_value(&req.tools)?;
        }
        if let Some(static_content) = &req.static_content {
            body["system_instruction"] = json!(static_content);
        }
        if let Some(cache) = &req.cache_name {
            body["cached_content"] = json!(cache);
        }

        let resp = self
            .authed(self.http.post(self.generate_url()))
            .json(&body)
            .send()
            .await
            .context("model request failed")?
            .error_for_status()
            .context("model request rejected")?;

        let state = DecodeState {
            body: resp.bytes_stream().boxed(),
            line_buf: String::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let stream = futures::stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(ev) = state.pending.pop_front() {
                    return Ok(Some((ev, state)));
                }
                if state.done {
                    return Ok(None);
                }
                match state.body.next().await {
                    Some(chunk) => {
                        let chunk = chunk.context("model stream read failed")?;
                        state.line_buf.push_str(&String::from_utf8_lossy(&chunk));
                        state.drain_lines();
                    }
                    None => {
                        // Flush a trailing frame without a newline terminator.
                        if !state.line_buf.trim().is_empty() {
                            state.line_buf.push('\n');
                            state.drain_lines();
                        }
                        state.done = true;
                        state.pending.push_back(StreamEvent::Done);
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn create_cache(
        &self,
        static_content: &str,
        tools: &[ToolSchema],
        ttl_secs: u64,
    ) -> anyhow::Result<CachedContent> {
        let body = json!({
            "model": self.model,
            "system_instruction": static_content,
            "tools": tools,
            "ttl": format!("{ttl_secs}s"),
        });
        let resp: Value = self
            .authed(self.http.post(self.cache_url(None)))
            .json(&body)
            .send()
            .await
            .context("cache create request failed")?
            .error_for_status()
            .context("cache create rejected")?
            .json()
            .await
            .context("cache create response unreadable")?;

        let name = resp
            .get("name")
            .and_then(|v| v.as_str())
            .context("cache create response missing name")?
            .to_string();
        let expire_time = resp
            .get("expire_time")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(CachedContent { name, expire_time })
    }

    async fn cache_exists(&self, name: &str) -> anyhow::Result<bool> {
        let resp = self
            .authed(self.http.get(self.cache_url(Some(name))))
            .send()
            .await
            .context("cache get request failed")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status().context("cache get rejected")?;
        Ok(true)
    }

    async fn delete_cache(&self, name: &str) -> anyhow::Result<()> {
        let resp = self
            .authed(self.http.delete(self.cache_url(Some(name))))
            .send()
            .await
            .context("cache delete request failed")?;
        // "Not found" is success: the resource is gone either way.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status().context("cache delete rejected")?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
