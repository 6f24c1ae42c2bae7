// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::json;

use crate::{
    CachedContent, ChunkStream, ModelClient, ModelRequest, StreamEvent, ToolSchema, UsageMetadata,
};

/// A pre-scripted mock client. Each call to `stream_generate` pops the next
/// event script from the front of the queue, so tests can specify exact
/// sequences — tool calls, thought deltas, usage metadata — without network
/// access. The last request is captured for payload assertions.
pub struct ScriptedMockClient {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    /// The last `ModelRequest` seen by this client.
    pub last_request: Arc<Mutex<Option<ModelRequest>>>,
    /// Every request seen, in order.
    pub requests: Arc<Mutex<Vec<ModelRequest>>>,
    caches: Arc<Mutex<HashSet<String>>>,
}

/// Process-wide so cache names stay unique across client instances.
static CACHE_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ScriptedMockClient {
    /// Build a client from a list of response scripts. The outer `Vec` is the
    /// ordered list of calls; the inner `Vec` the events for that call.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
            caches: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Convenience: a single text reply with the given usage counts.
    pub fn always_text(reply: impl Into<String>, usage: UsageMetadata) -> Self {
        let reply = reply.into();
        Self::new(vec![vec![
            StreamEvent::Frame(json!({"parts": [{"text": &reply}]})),
            StreamEvent::Text {
                content: reply,
                thought: false,
            },
            StreamEvent::Usage(usage),
            StreamEvent::Done,
        ]])
    }

    /// Convenience: round 1 emits a tool call, round 2 a final text reply.
    pub fn tool_then_text(
        tool_name: impl Into<String>,
        args: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        let name = tool_name.into();
        let text = final_text.into();
        Self::new(vec![
            vec![
                StreamEvent::Frame(json!({
                    "parts": [{"function_call": {"name": &name, "args": &args}}]
                })),
                StreamEvent::FunctionCall { name, args },
                StreamEvent::Usage(UsageMetadata {
                    prompt_token_count: 10,
                    candidates_token_count: 2,
                    total_token_count: 12,
                    cached_content_token_count: 0,
                }),
                StreamEvent::Done,
            ],
            vec![
                StreamEvent::Frame(json!({"parts": [{"text": &text}]})),
                StreamEvent::Text {
                    content: text,
                    thought: false,
                },
                StreamEvent::Usage(UsageMetadata {
                    prompt_token_count: 20,
                    candidates_token_count: 3,
                    total_token_count: 23,
                    cached_content_token_count: 0,
                }),
                StreamEvent::Done,
            ],
        ])
    }

    /// True when the named cache is currently registered on the mock side.
    pub fn has_cache(&self, name: &str) -> bool {
        self.caches.lock().unwrap().contains(name)
    }

    /// Register a cache as if it had been created earlier (for reuse tests).
    pub fn preload_cache(&self, name: impl Into<String>) {
        self.caches.lock().unwrap().insert(name.into());
    }
}

#[async_trait]
impl ModelClient for ScriptedMockClient {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn stream_generate(&self, req: ModelRequest) -> anyhow::Result<ChunkStream> {
        *self.last_request.lock().unwrap() = Some(req.clone());
        self.requests.lock().unwrap().push(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    StreamEvent::Text {
                        content: "[no more scripts]".into(),
                        thought: false,
                    },
                    StreamEvent::Usage(UsageMetadata::default()),
                    StreamEvent::Done,
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<StreamEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }

    async fn create_cache(
        &self,
        _static_content: &str,
        _tools: &[ToolSchema],
        _ttl_secs: u64,
    ) -> anyhow::Result<CachedContent> {
        let counter = CACHE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("cachedContents/mock-{counter}");
        self.caches.lock().unwrap().insert(name.clone());
        Ok(CachedContent {
            name,
            expire_time: None,
        })
    }

    async fn cache_exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.caches.lock().unwrap().contains(name))
    }

    async fn delete_cache(&self, name: &str) -> anyhow::Result<()> {
        self.caches.lock().unwrap().remove(name);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn req() -> ModelRequest {
        ModelRequest {
            contents: vec![crate::ContentRecord::user_text("hi")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scripted_single_text_reply() {
        let c = ScriptedMockClient::always_text("hello world", UsageMetadata::default());
        let mut stream = c.stream_generate(req()).await.unwrap();
        let mut saw_text = false;
        while let Some(ev) = stream.next().await {
            if let StreamEvent::Text { content, .. } = ev.unwrap() {
                assert_eq!(content, "hello world");
                saw_text = true;
            }
        }
        assert!(saw_text);
    }

    #[tokio::test]
    async fn tool_then_text_two_rounds() {
        let c = ScriptedMockClient::tool_then_text("grep", json!({"pattern": "x"}), "done");

        let mut events = Vec::new();
        let mut s1 = c.stream_generate(req()).await.unwrap();
        while let Some(ev) = s1.next().await {
            events.push(ev.unwrap());
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::FunctionCall { name, .. } if name == "grep")));

        let mut events2 = Vec::new();
        let mut s2 = c.stream_generate(req()).await.unwrap();
        while let Some(ev) = s2.next().await {
            events2.push(ev.unwrap());
        }
        assert!(events2
            .iter()
            .any(|e| matches!(e, StreamEvent::Text { content, .. } if content == "done")));
    }

    #[tokio::test]
    async fn captures_last_request() {
        let c = ScriptedMockClient::always_text("ok", UsageMetadata::default());
        let mut request = req();
        request.static_content = Some("identity".into());
        let _ = c.stream_generate(request).await.unwrap();
        let last = c.last_request.lock().unwrap();
        assert_eq!(last.as_ref().unwrap().static_content.as_deref(), Some("identity"));
    }

    #[tokio::test]
    async fn cache_lifecycle_in_memory() {
        let c = ScriptedMockClient::new(vec![]);
        let cache = c.create_cache("static", &[], 3600).await.unwrap();
        assert!(c.cache_exists(&cache.name).await.unwrap());
        c.delete_cache(&cache.name).await.unwrap();
        assert!(!c.cache_exists(&cache.name).await.unwrap());
        // Deleting again is not an error
        c.delete_cache(&cache.name).await.unwrap();
    }

    #[tokio::test]
    async fn fallback_when_scripts_exhausted() {
        let c = ScriptedMockClient::new(vec![]);
        let mut stream = c.stream_generate(req()).await.unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, StreamEvent::Text { content, .. } if content.contains("no more scripts")));
    }
}
