// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use takt_config::{Hyperparameters, Settings};
use takt_model::{GenerationConfig, ModelRequest, ToolSchema};
use takt_session::{Session, SessionService, StreamingLog};
use takt_tools::ToolRegistry;

use crate::cache::CacheManager;
use crate::prompt::PromptAssembler;

/// Running token counters for the cache-window protocol. Seeded from the
/// session before the first request of an invocation and refreshed from each
/// response's usage metadata, so cache decisions always see current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenSummary {
    pub prompt_token_count: u64,
    pub cached_content_token_count: u64,
}

impl TokenSummary {
    /// Tokens counted against the context that the remote cache has not
    /// absorbed yet.
    pub fn buffered(&self) -> u64 {
        if self.cached_content_token_count > 0 {
            self.prompt_token_count
                .saturating_sub(self.cached_content_token_count)
        } else {
            self.prompt_token_count
        }
    }

    fn is_unset(&self) -> bool {
        self.prompt_token_count == 0 && self.cached_content_token_count == 0
    }
}

/// Turns a session + instruction into a ready model request, driving the
/// cache-window protocol: when buffered tokens cross the threshold the cached
/// turn prefix expands to everything but the tail turn, the remote cache is
/// recreated over the new static layer, and the request omits that layer.
pub struct PayloadService {
    assembler: PromptAssembler,
    cache: CacheManager,
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionService>,
    settings: Arc<Settings>,
    pub last_token_summary: TokenSummary,
}

impl PayloadService {
    pub fn new(
        assembler: PromptAssembler,
        cache: CacheManager,
        registry: Arc<ToolRegistry>,
        sessions: Arc<SessionService>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            assembler,
            cache,
            registry,
            sessions,
            settings,
            last_token_summary: TokenSummary::default(),
        }
    }

    /// Seed the running counters from persisted session state. Only applies
    /// when nothing has been recorded yet, so mid-invocation state wins.
    pub fn seed_from_session(&mut self, session: &Session) {
        if self.last_token_summary.is_unset() {
            self.last_token_summary = TokenSummary {
                prompt_token_count: session.token_count,
                cached_content_token_count: session.cached_content_token_count,
            };
        }
    }

    /// Record the counters observed on a response.
    pub fn record_usage(&mut self, prompt_token_count: u64, cached_content_token_count: u64) {
        self.last_token_summary = TokenSummary {
            prompt_token_count,
            cached_content_token_count,
        };
    }

    pub async fn prepare_request(
        &mut self,
        session: &Session,
        instruction: Option<&str>,
    ) -> anyhow::Result<ModelRequest> {
        self.cache.sweep_expired().await;

        let threshold = self.settings.model.cache_update_threshold;
        let buffered = self.last_token_summary.buffered();
        let should_cache = buffered >= threshold;

        // When the cache is about to be recreated, the cacheable prefix first
        // expands to everything but the tail turn so the new cache absorbs
        // the buffered history. Persisted before assembly; monotonic.
        let mut working = session.clone();
        if should_cache {
            let target = working.turns.len().saturating_sub(1);
            if target > working.cached_turn_count {
                self.sessions
                    .update_cached_turn_count(&working.session_id, target)?;
                working.cached_turn_count = target;
            }
        }

        let now = Utc::now()
            .with_timezone(&self.sessions.timezone())
            .to_rfc3339();
        let prompt = self.assembler.assemble(&working, instruction, &now);

        let tools: Vec<ToolSchema> = self
            .registry
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        let tool_tokens: u64 = tools
            .iter()
            .map(|t| {
                ((t.name.len() + t.description.len() + t.parameters.to_string().len()) / 4) as u64
            })
            .sum();
        let estimated = prompt.estimated_tokens() + tool_tokens;
        if estimated > self.settings.model.context_limit {
            anyhow::bail!("Prompt exceeds context window limit. Aborting.");
        }

        let log = StreamingLog::new(
            self.sessions.repository().sessions_dir(),
            &working.session_id,
        );

        let mut cache_name = None;
        if !prompt.static_content.is_empty() {
            if should_cache {
                log.append(
                    "CACHE_DECISION",
                    &format!(
                        "CREATING/UPDATING cache. cached_tokens={}, prompt_tokens={}, buffered={buffered}, static_turns={}",
                        self.last_token_summary.cached_content_token_count,
                        self.last_token_summary.prompt_token_count,
                        working.cached_turn_count,
                    ),
                    &now,
                );
                cache_name = self
                    .cache
                    .create_cache(&working.session_id, &prompt.static_content, &tools)
                    .await;
            } else if let Some(name) = self.cache.reuse_cache(&prompt.static_content, &tools).await
            {
                log.append(
                    "CACHE_DECISION",
                    &format!(
                        "USING EXISTING cache (key={name}). buffered={buffered}, threshold={threshold}"
                    ),
                    &now,
                );
                cache_name = Some(name);
            } else {
                log.append(
                    "CACHE_DECISION",
                    &format!(
                        "NO CACHE (below threshold). prompt_tokens={}, threshold={threshold}, sending static + dynamic content",
                        self.last_token_summary.prompt_token_count,
                    ),
                    &now,
                );
            }
        }

        debug!(
            session_id = %working.session_id,
            cache = cache_name.as_deref().unwrap_or("none"),
            buffered,
            "request prepared"
        );

        let include_static = cache_name.is_none() && !prompt.static_content.is_empty();
        Ok(ModelRequest {
            static_content: include_static.then(|| prompt.static_content.clone()),
            contents: prompt.contents(),
            // A cache carries the tool definitions along with the static
            // layer, so they are not re-sent beside it.
            tools: if cache_name.is_some() { vec![] } else { tools },
            generation: self.generation_config(&working),
            cache_name,
        })
    }

    fn generation_config(&self, session: &Session) -> GenerationConfig {
        let defaults = &self.settings.parameters;
        let merged = match &session.hyperparameters {
            Some(overrides) => defaults.merged_with(overrides),
            None => defaults.clone(),
        };
        let Hyperparameters {
            temperature,
            top_p,
            top_k,
        } = merged;
        GenerationConfig {
            temperature,
            top_p,
            top_k,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use takt_model::ScriptedMockClient;
    use takt_session::{NewSessionParams, Turn};

    struct Fixture {
        _dir: tempfile::TempDir,
        sessions: Arc<SessionService>,
        client: Arc<ScriptedMockClient>,
        service: PayloadService,
        session_id: String,
    }

    fn fixture(threshold: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.model.cache_update_threshold = threshold;
        let settings = Arc::new(settings);

        let sessions = Arc::new(
            SessionService::new(dir.path().join("sessions"), &settings).unwrap(),
        );
        let session_id = sessions
            .create_new_session(NewSessionParams {
                purpose: "payload test".into(),
                background: "bg".into(),
                ..Default::default()
            })
            .unwrap();

        let client = Arc::new(ScriptedMockClient::new(vec![]));
        let cache = CacheManager::new(sessions.repository().sessions_dir(), client.clone());
        let service = PayloadService::new(
            PromptAssembler::new(dir.path()),
            cache,
            Arc::new(ToolRegistry::new()),
            sessions.clone(),
            settings,
        );

        Fixture {
            _dir: dir,
            sessions,
            client,
            service,
            session_id,
        }
    }

    fn push_turns(fx: &Fixture, n: usize) {
        for i in 0..n {
            fx.sessions
                .add_turn_to_session(
                    &fx.session_id,
                    Turn::UserTask {
                        instruction: format!("turn{i}"),
                        timestamp: "t".into(),
                    },
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn below_threshold_sends_static_inline() {
        let mut fx = fixture(1000);
        fx.service.record_usage(500, 0);
        let session = fx.sessions.get_session(&fx.session_id).unwrap().unwrap();

        let request = fx.service.prepare_request(&session, Some("go")).await.unwrap();
        assert!(request.static_content.is_some());
        assert!(request.cache_name.is_none());
    }

    #[tokio::test]
    async fn threshold_crossing_creates_cache_and_advances_prefix() {
        let mut fx = fixture(1000);
        push_turns(&fx, 4);
        // buffered = 1500 - 400 = 1100 ≥ 1000
        fx.service.record_usage(1500, 400);
        let session = fx.sessions.get_session(&fx.session_id).unwrap().unwrap();

        let request = fx.service.prepare_request(&session, None).await.unwrap();
        assert!(request.cache_name.is_some(), "expected a cache create");
        assert!(request.static_content.is_none(), "static must be omitted");
        assert!(request.tools.is_empty(), "tools travel inside the cache");

        let reloaded = fx.sessions.get_session(&fx.session_id).unwrap().unwrap();
        assert_eq!(reloaded.cached_turn_count, 3, "len(turns) - 1");
        assert!(fx.client.has_cache(request.cache_name.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn reuse_keeps_prefix_unchanged() {
        let mut fx = fixture(1000);
        push_turns(&fx, 4);
        fx.service.record_usage(1500, 400);
        let session = fx.sessions.get_session(&fx.session_id).unwrap().unwrap();
        let first = fx.service.prepare_request(&session, None).await.unwrap();
        let created = first.cache_name.clone().unwrap();

        // Next round: buffered below threshold, same static content (the
        // prefix advance happened last round and is already persisted).
        fx.service.record_usage(1500, 1100);
        let session = fx.sessions.get_session(&fx.session_id).unwrap().unwrap();
        let prefix_before = session.cached_turn_count;
        let request = fx.service.prepare_request(&session, None).await.unwrap();

        assert_eq!(request.cache_name.as_deref(), Some(created.as_str()));
        assert!(request.static_content.is_none());
        let reloaded = fx.sessions.get_session(&fx.session_id).unwrap().unwrap();
        assert_eq!(reloaded.cached_turn_count, prefix_before, "no advance on reuse");
    }

    #[tokio::test]
    async fn prefix_never_reaches_the_tail_turn() {
        let mut fx = fixture(10);
        push_turns(&fx, 3);
        fx.service.record_usage(5000, 0);
        let session = fx.sessions.get_session(&fx.session_id).unwrap().unwrap();
        fx.service.prepare_request(&session, None).await.unwrap();

        let reloaded = fx.sessions.get_session(&fx.session_id).unwrap().unwrap();
        assert!(reloaded.cached_turn_count <= reloaded.turns.len() - 1);
    }

    #[tokio::test]
    async fn seed_only_applies_once() {
        let mut fx = fixture(1000);
        let mut session = fx.sessions.get_session(&fx.session_id).unwrap().unwrap();
        session.token_count = 700;
        session.cached_content_token_count = 100;
        fx.service.seed_from_session(&session);
        assert_eq!(fx.service.last_token_summary.prompt_token_count, 700);

        // A later seed must not clobber mid-invocation counters.
        fx.service.record_usage(900, 100);
        fx.service.seed_from_session(&session);
        assert_eq!(fx.service.last_token_summary.prompt_token_count, 900);
    }

    #[tokio::test]
    async fn oversized_prompt_is_rejected() {
        let fx = fixture(1_000_000);
        // A service over the same store, but with a context window too small
        // for even the identity prompt.
        let mut settings = Settings::default();
        settings.model.context_limit = 1;
        let settings = Arc::new(settings);
        let client: Arc<ScriptedMockClient> = Arc::new(ScriptedMockClient::new(vec![]));
        let cache = CacheManager::new(fx.sessions.repository().sessions_dir(), client);
        let mut service = PayloadService::new(
            PromptAssembler::new("/tmp"),
            cache,
            Arc::new(ToolRegistry::new()),
            fx.sessions.clone(),
            settings,
        );
        let session = fx.sessions.get_session(&fx.session_id).unwrap().unwrap();
        let err = service.prepare_request(&session, None).await.unwrap_err();
        assert!(err.to_string().contains("context window"));
    }

    #[test]
    fn buffered_subtracts_only_when_cached_positive() {
        let summary = TokenSummary {
            prompt_token_count: 1500,
            cached_content_token_count: 400,
        };
        assert_eq!(summary.buffered(), 1100);
        let uncached = TokenSummary {
            prompt_token_count: 1500,
            cached_content_token_count: 0,
        };
        assert_eq!(uncached.buffered(), 1500);
    }

    #[tokio::test]
    async fn generation_config_prefers_session_hyperparameters() {
        let mut fx = fixture(1_000_000);
        fx.sessions
            .edit_session_meta(
                &fx.session_id,
                takt_session::SessionMetaPatch {
                    hyperparameters: Some(Hyperparameters {
                        temperature: Some(0.9),
                        top_p: None,
                        top_k: None,
                    }),
                    ..Default::default()
                },
            )
            .unwrap();
        let session = fx.sessions.get_session(&fx.session_id).unwrap().unwrap();
        let request = fx.service.prepare_request(&session, None).await.unwrap();
        assert_eq!(request.generation.temperature, Some(0.9));
    }
}
