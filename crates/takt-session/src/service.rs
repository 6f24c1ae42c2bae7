// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use chrono_tz::Tz;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::warn;

use takt_config::{Hyperparameters, Settings};

use crate::model::{Reference, Session, SessionOverview, TodoItem, Turn};
use crate::repository::SessionRepository;
use crate::StoreError;

/// Parameters for creating a fresh session.
#[derive(Debug, Clone, Default)]
pub struct NewSessionParams {
    pub purpose: String,
    pub background: String,
    pub roles: Vec<String>,
    pub multi_step_reasoning_enabled: bool,
    pub procedure: Option<String>,
    pub parent_id: Option<String>,
    pub hyperparameters: Option<Hyperparameters>,
}

/// Partial update applied by [`SessionService::edit_session_meta`].
#[derive(Debug, Clone, Default)]
pub struct SessionMetaPatch {
    pub purpose: Option<String>,
    pub background: Option<String>,
    pub multi_step_reasoning_enabled: Option<bool>,
    pub token_count: Option<u64>,
    pub hyperparameters: Option<Hyperparameters>,
}

/// Result of [`SessionService::get_or_create_session_data`]: either a loaded
/// (and already mutated) session, or the unsaved field bag for a new one.
#[derive(Debug)]
pub enum SessionData {
    Existing(Box<Session>),
    New {
        purpose: String,
        background: String,
        roles: Vec<String>,
        multi_step_reasoning_enabled: bool,
        turns: Vec<Turn>,
    },
}

/// The domain façade over the session store. All mutations run through the
/// repository's single-lock read-modify-write so concurrent processes always
/// observe consistent aggregates.
pub struct SessionService {
    repo: SessionRepository,
    tz: Tz,
    default_hyperparameters: Hyperparameters,
}

impl SessionService {
    pub fn new(sessions_dir: impl AsRef<Path>, settings: &Settings) -> Result<Self, StoreError> {
        let tz = match Tz::from_str(&settings.timezone) {
            Ok(tz) => tz,
            Err(_) => {
                warn!(timezone = %settings.timezone, "unknown timezone, using UTC");
                chrono_tz::UTC
            }
        };
        Ok(Self {
            repo: SessionRepository::new(sessions_dir.as_ref())?,
            tz,
            default_hyperparameters: settings.parameters.clone(),
        })
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// ISO-8601 timestamp in the configured timezone.
    pub fn now_timestamp(&self) -> String {
        Utc::now().with_timezone(&self.tz).to_rfc3339()
    }

    /// Filename-safe compact timestamp used for backup names.
    fn backup_timestamp(&self) -> String {
        Utc::now()
            .with_timezone(&self.tz)
            .format("%Y%m%d%H%M%S")
            .to_string()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Create a session whose id is the hash of its identity seed. With a
    /// `parent_id`, the parent must exist and the new id composes as
    /// `parent/hash`; a collision with an existing file is a hard failure.
    pub fn create_new_session(&self, params: NewSessionParams) -> Result<String, StoreError> {
        if let Some(parent_id) = &params.parent_id {
            let parent_file = self.repo.session_path(parent_id);
            let parent_dir = parent_file.with_extension("");
            if !parent_file.exists() && !parent_dir.is_dir() {
                return Err(StoreError::MissingParent {
                    id: parent_id.clone(),
                });
            }
        }

        let timestamp = self.now_timestamp();
        // serde_json maps serialize with sorted keys, so this seed is stable.
        let identity = json!({
            "purpose": &params.purpose,
            "background": &params.background,
            "roles": &params.roles,
            "multi_step_reasoning_enabled": params.multi_step_reasoning_enabled,
            "timestamp": &timestamp,
        })
        .to_string();
        let session_hash = content_hash(&identity);

        let session_id = match &params.parent_id {
            Some(parent) => format!("{parent}/{session_hash}"),
            None => session_hash,
        };
        if self.repo.session_path(&session_id).exists() {
            return Err(StoreError::IdCollision { id: session_id });
        }

        let session = Session {
            session_id: session_id.clone(),
            created_at: timestamp.clone(),
            purpose: params.purpose.clone(),
            background: params.background,
            roles: params.roles,
            multi_step_reasoning_enabled: params.multi_step_reasoning_enabled,
            procedure: params.procedure,
            references: vec![],
            artifacts: vec![],
            todos: None,
            turns: vec![],
            pools: vec![],
            token_count: 0,
            cached_content_token_count: 0,
            cached_turn_count: 0,
            hyperparameters: Some(
                params
                    .hyperparameters
                    .unwrap_or_else(|| self.default_hyperparameters.clone()),
            ),
        };

        self.repo.save(&session)?;
        self.repo.update_index(
            &session_id,
            Some(&params.purpose),
            Some(&timestamp),
            &self.now_timestamp(),
        )?;
        Ok(session_id)
    }

    /// Resolve the session an invocation will run against. With an id the
    /// session is loaded, the multi-step flag applied, and the instruction
    /// appended (persisted); without one, an unsaved field bag comes back for
    /// the caller to create.
    pub fn get_or_create_session_data(
        &self,
        session_id: Option<&str>,
        purpose: Option<&str>,
        background: Option<&str>,
        roles: &[String],
        multi_step_reasoning_enabled: bool,
        instruction: Option<&str>,
    ) -> Result<SessionData, StoreError> {
        if let Some(id) = session_id {
            let now = self.now_timestamp();
            let session = self.repo.update(id, |session| {
                session.multi_step_reasoning_enabled = multi_step_reasoning_enabled;
                if let Some(instruction) = instruction {
                    session.turns.push(Turn::UserTask {
                        instruction: instruction.to_string(),
                        timestamp: now.clone(),
                    });
                }
                session.clone()
            })?;
            self.repo.update_index(id, None, None, &self.now_timestamp())?;
            return Ok(SessionData::Existing(Box::new(session)));
        }

        let (purpose, background) = match (purpose, background) {
            (Some(p), Some(b)) if !p.is_empty() && !b.is_empty() => (p, b),
            _ => {
                return Err(StoreError::InvalidOperation(
                    "a new session requires purpose and background".into(),
                ))
            }
        };

        let mut turns = Vec::new();
        if let Some(instruction) = instruction {
            turns.push(Turn::UserTask {
                instruction: instruction.to_string(),
                timestamp: self.now_timestamp(),
            });
        }
        Ok(SessionData::New {
            purpose: purpose.to_string(),
            background: background.to_string(),
            roles: roles.to_vec(),
            multi_step_reasoning_enabled,
            turns,
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.repo.find(session_id)
    }

    pub fn list_sessions(&self) -> Result<BTreeMap<String, SessionOverview>, StoreError> {
        self.repo.list()
    }

    pub fn backup_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.repo.backup(session_id, &self.backup_timestamp())
    }

    pub fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.repo.delete(session_id)
    }

    /// Fork at `fork_index`, which must point at a `model_response` turn.
    /// The fork keeps `turns[0..=fork_index]`, copies identity fields and
    /// references, and starts with a zero token count.
    pub fn fork_session(&self, session_id: &str, fork_index: usize) -> Result<String, StoreError> {
        self.backup_session(session_id)?;
        let original = self
            .repo
            .find(session_id)?
            .ok_or_else(|| StoreError::NotFound {
                id: session_id.to_string(),
            })?;

        let turn = original.turns.get(fork_index).ok_or_else(|| {
            StoreError::InvalidOperation(format!(
                "fork index {fork_index} is out of range (session has {} turns)",
                original.turns.len()
            ))
        })?;
        if !turn.is_model_response() {
            return Err(StoreError::InvalidOperation(format!(
                "forking is only allowed from a 'model_response' turn; turn {} is '{}'",
                fork_index + 1,
                turn.type_name()
            )));
        }

        let forked_purpose = format!("Fork of: {}", original.purpose);
        let timestamp = self.now_timestamp();
        let identity = json!({
            "purpose": &forked_purpose,
            "original_id": session_id,
            "fork_at_turn": fork_index,
            "timestamp": &timestamp,
        })
        .to_string();
        let suffix = content_hash(&identity);

        let new_session_id = match session_id.rsplit_once('/') {
            Some((parent, _)) => format!("{parent}/{suffix}"),
            None => suffix,
        };

        let forked = Session {
            session_id: new_session_id.clone(),
            created_at: timestamp.clone(),
            purpose: forked_purpose.clone(),
            background: original.background,
            roles: original.roles,
            multi_step_reasoning_enabled: original.multi_step_reasoning_enabled,
            procedure: original.procedure,
            references: original.references,
            artifacts: original.artifacts,
            todos: None,
            turns: original.turns[..=fork_index].to_vec(),
            pools: vec![],
            token_count: 0,
            cached_content_token_count: 0,
            cached_turn_count: 0,
            hyperparameters: original
                .hyperparameters
                .or_else(|| Some(self.default_hyperparameters.clone())),
        };

        self.repo.save(&forked)?;
        self.repo.update_index(
            &new_session_id,
            Some(&forked_purpose),
            Some(&timestamp),
            &self.now_timestamp(),
        )?;
        Ok(new_session_id)
    }

    // ── Turns and pool ────────────────────────────────────────────────────────

    pub fn add_turn_to_session(&self, session_id: &str, turn: Turn) -> Result<(), StoreError> {
        self.repo.update(session_id, |session| {
            session.turns.push(turn);
        })?;
        self.repo
            .update_index(session_id, None, None, &self.now_timestamp())
    }

    pub fn add_to_pool(&self, session_id: &str, turn: Turn) -> Result<(), StoreError> {
        self.repo.update(session_id, |session| {
            session.pools.push(turn);
        })
    }

    /// Move every pool entry to the tail of `turns`, in order, and empty the
    /// pool. Performed under a single lock hold, so a concurrently appending
    /// tool process observes either the old or the new state, never a mix.
    pub fn merge_pool_into_turns(&self, session_id: &str) -> Result<(), StoreError> {
        self.repo.update(session_id, |session| {
            let pools = std::mem::take(&mut session.pools);
            session.turns.extend(pools);
        })
    }

    /// Store the streaming round's raw frames on the most recent
    /// `function_calling` pool turn, for thought-signature restoration.
    pub fn set_raw_response_on_last_call(
        &self,
        session_id: &str,
        raw: &str,
    ) -> Result<(), StoreError> {
        self.repo.update(session_id, |session| {
            if let Some(Turn::FunctionCalling { raw_response, .. }) = session
                .pools
                .iter_mut()
                .rev()
                .find(|t| matches!(t, Turn::FunctionCalling { .. }))
            {
                *raw_response = Some(raw.to_string());
            }
        })
    }

    /// Replace the 1-based inclusive turn range `[start, end]` with a single
    /// `compressed_history` turn carrying the summary.
    pub fn compress_turns(
        &self,
        session_id: &str,
        start_turn: u64,
        end_turn: u64,
        summary: &str,
    ) -> Result<(), StoreError> {
        let now = self.now_timestamp();
        self.repo.update(session_id, |session| {
            let len = session.turns.len() as u64;
            if start_turn == 0 || end_turn < start_turn || end_turn > len {
                return Err(StoreError::InvalidOperation(format!(
                    "turn range {start_turn}..={end_turn} is invalid for {len} turns"
                )));
            }
            let lo = (start_turn - 1) as usize;
            let hi = end_turn as usize;
            let compressed = Turn::CompressedHistory {
                content: summary.to_string(),
                original_turns_range: (start_turn, end_turn),
                timestamp: now.clone(),
            };
            session.turns.splice(lo..hi, [compressed]);
            Ok(())
        })?
    }

    // ── Counters ──────────────────────────────────────────────────────────────

    pub fn update_token_count(&self, session_id: &str, count: u64) -> Result<(), StoreError> {
        self.repo.update(session_id, |session| {
            session.token_count = count;
        })?;
        self.repo
            .update_index(session_id, None, None, &self.now_timestamp())
    }

    pub fn update_cached_content_token_count(
        &self,
        session_id: &str,
        count: u64,
    ) -> Result<(), StoreError> {
        self.repo.update(session_id, |session| {
            session.cached_content_token_count = count;
        })
    }

    /// Advance the cached-turn prefix. Monotonic: a value at or below the
    /// current one is ignored.
    pub fn update_cached_turn_count(
        &self,
        session_id: &str,
        count: usize,
    ) -> Result<(), StoreError> {
        self.repo.update(session_id, |session| {
            if count > session.cached_turn_count {
                session.cached_turn_count = count;
            }
        })
    }

    // ── Metadata, references, todos ───────────────────────────────────────────

    pub fn edit_session_meta(
        &self,
        session_id: &str,
        patch: SessionMetaPatch,
    ) -> Result<(), StoreError> {
        self.backup_session(session_id)?;
        let purpose = self.repo.update(session_id, |session| {
            if let Some(p) = patch.purpose {
                session.purpose = p;
            }
            if let Some(b) = patch.background {
                session.background = b;
            }
            if let Some(m) = patch.multi_step_reasoning_enabled {
                session.multi_step_reasoning_enabled = m;
            }
            if let Some(t) = patch.token_count {
                session.token_count = t;
            }
            if let Some(h) = patch.hyperparameters {
                session.hyperparameters = Some(h);
            }
            session.purpose.clone()
        })?;
        self.repo
            .update_index(session_id, Some(&purpose), None, &self.now_timestamp())
    }

    pub fn update_references(
        &self,
        session_id: &str,
        references: Vec<Reference>,
    ) -> Result<(), StoreError> {
        self.repo.update(session_id, |session| {
            session.references = references;
        })
    }

    /// Append file references, deduplicating on absolute path. Paths that are
    /// not files are skipped with a warning. Returns how many were added.
    pub fn add_references(
        &self,
        session_id: &str,
        file_paths: &[String],
    ) -> Result<usize, StoreError> {
        let mut resolved = Vec::new();
        for raw in file_paths {
            let abs = std::fs::canonicalize(raw).unwrap_or_else(|_| raw.into());
            if !abs.is_file() {
                warn!(path = %abs.display(), "reference path is not a file, skipping");
                continue;
            }
            resolved.push(abs.to_string_lossy().into_owned());
        }

        self.repo.update(session_id, |session| {
            let mut existing: std::collections::HashSet<String> = session
                .references
                .iter()
                .map(|r| r.path.clone())
                .collect();
            let mut added = 0;
            for path in resolved {
                if existing.insert(path.clone()) {
                    session.references.push(Reference::new(path));
                    added += 1;
                }
            }
            added
        })
    }

    pub fn add_artifacts(&self, session_id: &str, paths: &[String]) -> Result<(), StoreError> {
        self.repo.update(session_id, |session| {
            for path in paths {
                if !session.artifacts.contains(path) {
                    session.artifacts.push(path.clone());
                }
            }
        })
    }

    pub fn update_todos(&self, session_id: &str, todos: Vec<TodoItem>) -> Result<(), StoreError> {
        self.repo.update(session_id, |session| {
            session.todos = Some(todos);
        })
    }

    pub fn delete_todos(&self, session_id: &str) -> Result<(), StoreError> {
        self.repo.update(session_id, |session| {
            session.todos = None;
        })
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ToolResponsePayload, ToolStatus};

    fn service() -> (tempfile::TempDir, SessionService) {
        let dir = tempfile::tempdir().unwrap();
        let service =
            SessionService::new(dir.path().join("sessions"), &Settings::default()).unwrap();
        (dir, service)
    }

    fn new_params(purpose: &str) -> NewSessionParams {
        NewSessionParams {
            purpose: purpose.into(),
            background: "bg".into(),
            roles: vec!["roles/dev.md".into()],
            ..Default::default()
        }
    }

    fn user_turn(text: &str) -> Turn {
        Turn::UserTask {
            instruction: text.into(),
            timestamp: "t".into(),
        }
    }

    fn model_turn(text: &str) -> Turn {
        Turn::ModelResponse {
            content: text.into(),
            timestamp: "t".into(),
            raw_response: None,
        }
    }

    #[test]
    fn create_produces_hex_id_and_index_entry() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("demo")).unwrap();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        let session = svc.get_session(&id).unwrap().unwrap();
        assert_eq!(session.purpose, "demo");
        assert!(session.hyperparameters.is_some());

        let index = svc.list_sessions().unwrap();
        assert_eq!(
            index[&id].created_at.as_deref(),
            Some(session.created_at.as_str())
        );
    }

    #[test]
    fn child_id_composes_under_parent() {
        let (_dir, svc) = service();
        let parent = svc.create_new_session(new_params("parent")).unwrap();
        let mut params = new_params("child");
        params.parent_id = Some(parent.clone());
        let child = svc.create_new_session(params).unwrap();
        assert!(child.starts_with(&format!("{parent}/")));
        assert!(svc.repository().session_path(&child).exists());
    }

    #[test]
    fn missing_parent_is_an_error() {
        let (_dir, svc) = service();
        let mut params = new_params("orphan");
        params.parent_id = Some("does-not-exist".into());
        let err = svc.create_new_session(params).unwrap_err();
        assert!(matches!(err, StoreError::MissingParent { .. }));
    }

    #[test]
    fn pool_appends_do_not_touch_turns() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("p")).unwrap();
        svc.add_turn_to_session(&id, user_turn("a")).unwrap();
        svc.add_to_pool(&id, user_turn("pooled")).unwrap();

        let s = svc.get_session(&id).unwrap().unwrap();
        assert_eq!(s.turns.len(), 1);
        assert_eq!(s.pools.len(), 1);
    }

    #[test]
    fn merge_moves_pool_in_order_and_is_idempotent() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("p")).unwrap();
        svc.add_turn_to_session(&id, user_turn("first")).unwrap();
        svc.add_to_pool(&id, user_turn("p1")).unwrap();
        svc.add_to_pool(&id, user_turn("p2")).unwrap();

        svc.merge_pool_into_turns(&id).unwrap();
        let once = svc.get_session(&id).unwrap().unwrap();
        assert_eq!(once.turns.len(), 3);
        assert!(once.pools.is_empty());
        match (&once.turns[1], &once.turns[2]) {
            (
                Turn::UserTask { instruction: a, .. },
                Turn::UserTask { instruction: b, .. },
            ) => {
                assert_eq!(a, "p1");
                assert_eq!(b, "p2");
            }
            other => panic!("pool order lost: {other:?}"),
        }

        svc.merge_pool_into_turns(&id).unwrap();
        let twice = svc.get_session(&id).unwrap().unwrap();
        assert_eq!(twice, once, "second merge must be a no-op");
    }

    #[test]
    fn fork_truncates_at_model_response_and_zeroes_tokens() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("orig")).unwrap();
        svc.add_turn_to_session(&id, user_turn("q1")).unwrap();
        svc.add_turn_to_session(&id, model_turn("a1")).unwrap();
        svc.add_turn_to_session(&id, user_turn("q2")).unwrap();
        svc.update_token_count(&id, 500).unwrap();

        let fork_id = svc.fork_session(&id, 1).unwrap();
        let original = svc.get_session(&id).unwrap().unwrap();
        let fork = svc.get_session(&fork_id).unwrap().unwrap();

        assert_ne!(fork_id, id);
        assert_eq!(fork.turns, original.turns[..=1].to_vec());
        assert_eq!(fork.token_count, 0);
        assert!(fork.purpose.starts_with("Fork of:"));
        // Original untouched.
        assert_eq!(original.turns.len(), 3);
        assert_eq!(original.token_count, 500);
    }

    #[test]
    fn fork_of_child_stays_under_same_parent() {
        let (_dir, svc) = service();
        let parent = svc.create_new_session(new_params("p")).unwrap();
        let mut params = new_params("c");
        params.parent_id = Some(parent.clone());
        let child = svc.create_new_session(params).unwrap();
        svc.add_turn_to_session(&child, model_turn("a")).unwrap();

        let fork = svc.fork_session(&child, 0).unwrap();
        assert!(fork.starts_with(&format!("{parent}/")));
        assert_ne!(fork, child);
    }

    #[test]
    fn fork_rejects_non_model_response() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("p")).unwrap();
        svc.add_turn_to_session(&id, user_turn("q")).unwrap();
        let err = svc.fork_session(&id, 0).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
    }

    #[test]
    fn fork_rejects_out_of_range_index() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("p")).unwrap();
        let err = svc.fork_session(&id, 3).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
    }

    #[test]
    fn fork_at_terminal_model_response_keeps_all_turns() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("p")).unwrap();
        svc.add_turn_to_session(&id, user_turn("q")).unwrap();
        svc.add_turn_to_session(&id, model_turn("a")).unwrap();
        let fork = svc.fork_session(&id, 1).unwrap();
        let forked = svc.get_session(&fork).unwrap().unwrap();
        assert_eq!(
            forked.turns,
            svc.get_session(&id).unwrap().unwrap().turns
        );
    }

    #[test]
    fn cached_turn_count_is_monotonic() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("p")).unwrap();
        svc.update_cached_turn_count(&id, 5).unwrap();
        svc.update_cached_turn_count(&id, 3).unwrap();
        assert_eq!(
            svc.get_session(&id).unwrap().unwrap().cached_turn_count,
            5
        );
        svc.update_cached_turn_count(&id, 8).unwrap();
        assert_eq!(
            svc.get_session(&id).unwrap().unwrap().cached_turn_count,
            8
        );
    }

    #[test]
    fn raw_response_lands_on_last_function_calling_pool_turn() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("p")).unwrap();
        svc.add_to_pool(
            &id,
            Turn::FunctionCalling {
                response: "older({})".into(),
                timestamp: "t1".into(),
                raw_response: None,
            },
        )
        .unwrap();
        svc.add_to_pool(
            &id,
            Turn::ToolResponse {
                name: "older".into(),
                response: ToolResponsePayload::succeeded("ok"),
                timestamp: "t2".into(),
            },
        )
        .unwrap();
        svc.set_raw_response_on_last_call(&id, "[{\"parts\":[]}]").unwrap();

        let s = svc.get_session(&id).unwrap().unwrap();
        match &s.pools[0] {
            Turn::FunctionCalling { raw_response, .. } => {
                assert_eq!(raw_response.as_deref(), Some("[{\"parts\":[]}]"));
            }
            other => panic!("unexpected pool head: {other:?}"),
        }
    }

    #[test]
    fn compress_replaces_range_with_summary_turn() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("p")).unwrap();
        for i in 0..4 {
            svc.add_turn_to_session(&id, user_turn(&format!("turn{i}")))
                .unwrap();
        }
        svc.compress_turns(&id, 2, 3, "summary of 2..3").unwrap();

        let s = svc.get_session(&id).unwrap().unwrap();
        assert_eq!(s.turns.len(), 3);
        match &s.turns[1] {
            Turn::CompressedHistory {
                content,
                original_turns_range,
                ..
            } => {
                assert_eq!(content, "summary of 2..3");
                assert_eq!(*original_turns_range, (2, 3));
            }
            other => panic!("expected compressed turn, got {other:?}"),
        }
    }

    #[test]
    fn compress_rejects_bad_ranges() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("p")).unwrap();
        svc.add_turn_to_session(&id, user_turn("only")).unwrap();
        assert!(svc.compress_turns(&id, 0, 1, "s").is_err());
        assert!(svc.compress_turns(&id, 1, 2, "s").is_err());
        assert!(svc.compress_turns(&id, 2, 1, "s").is_err());
    }

    #[test]
    fn get_or_create_resumes_and_appends_instruction() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("p")).unwrap();
        let data = svc
            .get_or_create_session_data(Some(&id), None, None, &[], true, Some("go"))
            .unwrap();
        match data {
            SessionData::Existing(session) => {
                assert!(session.multi_step_reasoning_enabled);
                assert_eq!(session.turns.len(), 1);
            }
            other => panic!("expected existing, got {other:?}"),
        }
        // Mutations were persisted, not just returned.
        let reloaded = svc.get_session(&id).unwrap().unwrap();
        assert_eq!(reloaded.turns.len(), 1);
    }

    #[test]
    fn get_or_create_requires_identity_for_new() {
        let (_dir, svc) = service();
        let err = svc
            .get_or_create_session_data(None, Some("p"), None, &[], false, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
    }

    #[test]
    fn edit_meta_patches_and_reindexes() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("before")).unwrap();
        svc.edit_session_meta(
            &id,
            SessionMetaPatch {
                purpose: Some("after".into()),
                token_count: Some(42),
                ..Default::default()
            },
        )
        .unwrap();
        let s = svc.get_session(&id).unwrap().unwrap();
        assert_eq!(s.purpose, "after");
        assert_eq!(s.token_count, 42);
        assert_eq!(
            svc.list_sessions().unwrap()[&id].purpose.as_deref(),
            Some("after")
        );
    }

    #[test]
    fn add_references_dedups_and_skips_non_files() {
        let (dir, svc) = service();
        let id = svc.create_new_session(new_params("p")).unwrap();
        let file = dir.path().join("ref.txt");
        std::fs::write(&file, "content").unwrap();
        let file_str = file.to_string_lossy().into_owned();

        let added = svc
            .add_references(&id, &[file_str.clone(), "nonexistent-path".into()])
            .unwrap();
        assert_eq!(added, 1);
        let again = svc.add_references(&id, &[file_str]).unwrap();
        assert_eq!(again, 0, "duplicate path must not be re-added");
    }

    #[test]
    fn todos_update_and_delete() {
        let (_dir, svc) = service();
        let id = svc.create_new_session(new_params("p")).unwrap();
        svc.update_todos(
            &id,
            vec![TodoItem {
                title: "t1".into(),
                description: String::new(),
                checked: false,
            }],
        )
        .unwrap();
        assert_eq!(
            svc.get_session(&id).unwrap().unwrap().todos.unwrap().len(),
            1
        );
        svc.delete_todos(&id).unwrap();
        assert!(svc.get_session(&id).unwrap().unwrap().todos.is_none());
    }

    #[test]
    fn tool_status_serializes_lowercase() {
        let payload = ToolResponsePayload::failed("boom");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(payload.status, ToolStatus::Failed);
    }

    #[test]
    fn delete_session_drops_descendant_index_entries() {
        let (_dir, svc) = service();
        let parent = svc.create_new_session(new_params("p")).unwrap();
        let mut params = new_params("c");
        params.parent_id = Some(parent.clone());
        let child = svc.create_new_session(params).unwrap();

        svc.delete_session(&parent).unwrap();
        let list = svc.list_sessions().unwrap();
        assert!(!list.contains_key(&parent));
        assert!(!list.contains_key(&child));
        assert!(svc.get_session(&child).unwrap().is_none());
    }
}
