// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{ModelRequest, StreamEvent, ToolSchema};

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// A remote cache resource as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedContent {
    /// Provider resource name, e.g. `cachedContents/abc123`.
    pub name: String,
    /// Provider-reported expiry, when available.
    pub expire_time: Option<String>,
}

/// The model adapter the runtime consumes.
///
/// The streaming contract: a chunk stream whose events carry zero or more
/// text parts (thought-flagged), an optional function call, raw frames for
/// persistence, and usage metadata on the final chunk. Everything else about
/// the wire protocol is the implementation's business.
///
/// Cache operations default to "unsupported" so that providers without a
/// content cache degrade gracefully — the cache manager treats every error
/// here as "no cache for this request".
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Human-readable client name for logs.
    fn name(&self) -> &str;

    /// Model identifier forwarded to the provider.
    fn model_name(&self) -> &str;

    /// Send a prepared request and return the streaming response.
    async fn stream_generate(&self, req: ModelRequest) -> anyhow::Result<ChunkStream>;

    /// Create a remote cache holding the static content plus tool definitions.
    async fn create_cache(
        &self,
        _static_content: &str,
        _tools: &[ToolSchema],
        _ttl_secs: u64,
    ) -> anyhow::Result<CachedContent> {
        anyhow::bail!("content caching is not supported by {}", self.name())
    }

    /// Check that a previously created cache still exists remotely.
    async fn cache_exists(&self, _name: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Delete a remote cache. "Not found" must not be an error.
    async fn delete_cache(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
