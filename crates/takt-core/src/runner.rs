// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use takt_config::Settings;
use takt_model::ModelClient;
use takt_session::{
    NewSessionParams, ProcessRegistry, SessionData, SessionService, StoreError,
};
use takt_tools::{ToolContext, ToolRegistry};

use crate::agent::StreamingAgent;
use crate::cache::CacheManager;
use crate::events::AgentEvent;
use crate::executor::ToolExecutor;
use crate::payload::PayloadService;
use crate::prompt::PromptAssembler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    /// Single-line JSON identity on stdout, for subprocess callers.
    Json,
}

/// Everything one invocation needs, resolved from the CLI surface.
#[derive(Debug, Clone, Default)]
pub struct TaktArgs {
    /// Resume this session. Mutually exclusive with the identity fields.
    pub session: Option<String>,
    pub purpose: Option<String>,
    pub background: Option<String>,
    pub roles: Vec<String>,
    pub procedure: Option<String>,
    /// Create the new session as a child of this one.
    pub parent_session: Option<String>,
    pub instruction: Option<String>,
    pub references: Vec<String>,
    pub artifacts: Vec<String>,
    pub multi_step_reasoning: bool,
    pub output_format: OutputFormat,
    /// Assemble the prompt and return it instead of calling the model.
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub session_id: String,
    pub final_text: String,
    pub token_count: u64,
    /// True when this invocation created the session.
    pub created: bool,
}

/// Removes the pid file on every exit path, including errors and panics.
struct PidGuard {
    registry: ProcessRegistry,
    session_id: String,
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        self.registry.cleanup(&self.session_id);
    }
}

/// Top-level orchestration for a single agent invocation: resolve or create
/// the session, claim it in the process registry, run the streaming agent,
/// and persist the final turn.
pub struct TaktRunner {
    settings: Arc<Settings>,
    project_root: PathBuf,
    client: Arc<dyn ModelClient>,
}

impl TaktRunner {
    pub fn new(
        settings: Arc<Settings>,
        project_root: impl Into<PathBuf>,
        client: Arc<dyn ModelClient>,
    ) -> Self {
        Self {
            settings,
            project_root: project_root.into(),
            client,
        }
    }

    pub async fn run(
        &self,
        args: TaktArgs,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<RunOutcome> {
        if args.session.is_some() && (args.purpose.is_some() || args.background.is_some()) {
            anyhow::bail!("--session cannot be combined with --purpose/--background");
        }

        let sessions = Arc::new(SessionService::new(
            self.project_root.join("sessions"),
            &self.settings,
        )?);
        let registry = ProcessRegistry::new(&self.project_root);

        let (session_id, created) = self.resolve_session(&sessions, &registry, &args)?;

        if !args.references.is_empty() {
            sessions.add_references(&session_id, &args.references)?;
        }
        if !args.artifacts.is_empty() {
            sessions.add_artifacts(&session_id, &args.artifacts)?;
        }

        // Hint for tool subprocesses that cannot be handed the id explicitly.
        std::env::set_var("TAKT_SESSION_ID", &session_id);

        if args.dry_run {
            let session =
                sessions
                    .get_session(&session_id)?
                    .ok_or_else(|| StoreError::NotFound {
                        id: session_id.clone(),
                    })?;
            let assembler = PromptAssembler::new(&self.project_root);
            let prompt = assembler.assemble(&session, None, &sessions.now_timestamp());
            return Ok(RunOutcome {
                session_id,
                final_text: prompt.render_text(),
                token_count: 0,
                created,
            });
        }

        registry.register(&session_id, std::process::id())?;
        let _guard = PidGuard {
            registry: registry.clone(),
            session_id: session_id.clone(),
        };

        let tool_registry = Arc::new(ToolRegistry::with_builtins());
        let context = ToolContext {
            sessions: sessions.clone(),
            session_id: Some(session_id.clone()),
            settings: self.settings.clone(),
            project_root: self.project_root.clone(),
        };
        let executor = ToolExecutor::new(tool_registry.clone(), context);
        let cache = CacheManager::new(sessions.repository().sessions_dir(), self.client.clone());
        let payload = PayloadService::new(
            PromptAssembler::new(&self.project_root),
            cache,
            tool_registry,
            sessions.clone(),
            self.settings.clone(),
        );
        let mut agent = StreamingAgent::new(
            sessions.clone(),
            self.client.clone(),
            executor,
            payload,
            self.settings.clone(),
        );

        let outcome = agent.run(&session_id, tx).await?;

        for turn in outcome.turns {
            sessions.add_to_pool(&session_id, turn)?;
        }
        sessions.merge_pool_into_turns(&session_id)?;

        debug!(session_id = %session_id, created, "invocation complete");
        Ok(RunOutcome {
            session_id,
            final_text: outcome.final_text,
            token_count: outcome.token_count,
            created,
        })
    }

    fn resolve_session(
        &self,
        sessions: &Arc<SessionService>,
        registry: &ProcessRegistry,
        args: &TaktArgs,
    ) -> anyhow::Result<(String, bool)> {
        if let Some(id) = &args.session {
            if let Some(pid) = registry.running_pid(id) {
                return Err(StoreError::SessionBusy {
                    id: id.clone(),
                    pid,
                }
                .into());
            }
            sessions.get_or_create_session_data(
                Some(id),
                None,
                None,
                &[],
                args.multi_step_reasoning,
                args.instruction.as_deref(),
            )?;
            return Ok((id.clone(), false));
        }

        let data = sessions.get_or_create_session_data(
            None,
            args.purpose.as_deref(),
            args.background.as_deref(),
            &args.roles,
            args.multi_step_reasoning,
            args.instruction.as_deref(),
        )?;
        match data {
            SessionData::New {
                purpose,
                background,
                roles,
                multi_step_reasoning_enabled,
                turns,
            } => {
                let id = sessions.create_new_session(NewSessionParams {
                    purpose,
                    background,
                    roles,
                    multi_step_reasoning_enabled,
                    procedure: args.procedure.clone(),
                    parent_id: args.parent_session.clone(),
                    hyperparameters: None,
                })?;
                for turn in turns {
                    sessions.add_turn_to_session(&id, turn)?;
                }
                Ok((id, true))
            }
            SessionData::Existing(session) => Ok((session.session_id.clone(), false)),
        }
    }
}

/// Walk up from the current working directory until a `.git` directory or a
/// `takt.yaml` is found; fall back to the working directory itself.
pub fn find_project_root() -> anyhow::Result<PathBuf> {
    let start = std::env::current_dir()?;
    let mut current: &Path = start.as_path();
    loop {
        if current.join(".git").exists() || current.join("takt.yaml").is_file() {
            return Ok(std::fs::canonicalize(current)?);
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    Ok(std::fs::canonicalize(&start)?)
}
