// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent-loop scenarios driven end to end through [`TaktRunner`] with the
//! scripted mock client.
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use takt_config::Settings;
use takt_model::{ModelClient, ScriptedMockClient, StreamEvent, UsageMetadata};
use takt_session::{Session, SessionService, ToolStatus, Turn};

use crate::agent::{EMPTY_STREAM_TEXT, THOUGHTS_ONLY_TEXT, TOOL_LIMIT_TEXT};
use crate::{OutputFormat, RunOutcome, TaktArgs, TaktRunner};

fn usage(prompt: u64, candidates: u64, cached: u64) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: prompt,
        candidates_token_count: candidates,
        total_token_count: prompt + candidates,
        cached_content_token_count: cached,
    }
}

fn text_round(text: &str, u: UsageMetadata) -> Vec<StreamEvent> {
    vec![
        StreamEvent::Frame(json!({"parts": [{"text": text}]})),
        StreamEvent::Text {
            content: text.into(),
            thought: false,
        },
        StreamEvent::Usage(u),
        StreamEvent::Done,
    ]
}

fn tool_round(name: &str, args: serde_json::Value, u: UsageMetadata) -> Vec<StreamEvent> {
    vec![
        StreamEvent::Frame(json!({"parts": [{"function_call": {"name": name, "args": &args}}]})),
        StreamEvent::FunctionCall {
            name: name.into(),
            args,
        },
        StreamEvent::Usage(u),
        StreamEvent::Done,
    ]
}

fn new_session_args(instruction: &str) -> TaktArgs {
    TaktArgs {
        purpose: Some("demo".into()),
        background: Some("x".into()),
        roles: vec!["r.md".into()],
        instruction: Some(instruction.into()),
        output_format: OutputFormat::Json,
        ..Default::default()
    }
}

async fn run_with(
    client: Arc<ScriptedMockClient>,
    settings: Settings,
    args: TaktArgs,
) -> (tempfile::TempDir, RunOutcome, Session) {
    let dir = tempfile::tempdir().unwrap();
    let settings = Arc::new(settings);
    let runner = TaktRunner::new(settings.clone(), dir.path(), client as Arc<dyn ModelClient>);

    let (tx, mut rx) = mpsc::channel(256);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let outcome = runner.run(args, tx).await.unwrap();
    drain.await.unwrap();

    let sessions = SessionService::new(dir.path().join("sessions"), &settings).unwrap();
    let session = sessions
        .get_session(&outcome.session_id)
        .unwrap()
        .expect("session must exist after a run");
    (dir, outcome, session)
}

fn turn_types(session: &Session) -> Vec<&'static str> {
    session.turns.iter().map(Turn::type_name).collect()
}

// ── S1: single-turn agent with no tools ───────────────────────────────────────

#[tokio::test]
async fn single_turn_records_user_task_then_model_response() {
    let client = Arc::new(ScriptedMockClient::new(vec![text_round(
        "world",
        usage(5, 1, 0),
    )]));
    let (_dir, outcome, session) = run_with(
        client,
        Settings::default(),
        new_session_args("hello"),
    )
    .await;

    assert_eq!(outcome.final_text, "world");
    assert_eq!(turn_types(&session), vec!["user_task", "model_response"]);
    assert_eq!(session.token_count, 5);
    assert_eq!(session.cached_content_token_count, 0);
    assert_eq!(session.cached_turn_count, 0);
    assert!(session.pools.is_empty(), "pool must be merged after the run");
    // Observable cost: total − newly cached = 6 − 0.
    assert_eq!(outcome.token_count, 6);
}

// ── S2: agent with a single tool call ─────────────────────────────────────────

#[tokio::test]
async fn tool_call_round_trips_through_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("data.txt");
    std::fs::write(&target, "file body").unwrap();

    let client = Arc::new(ScriptedMockClient::new(vec![
        tool_round(
            "read_file",
            json!({"file_path": target.to_string_lossy()}),
            usage(10, 2, 0),
        ),
        text_round("done", usage(20, 3, 0)),
    ]));
    let (_dir, outcome, session) = run_with(
        client,
        Settings::default(),
        new_session_args("search"),
    )
    .await;

    assert_eq!(outcome.final_text, "done");
    assert_eq!(
        turn_types(&session),
        vec![
            "user_task",
            "function_calling",
            "tool_response",
            "model_response"
        ]
    );
    match &session.turns[2] {
        Turn::ToolResponse { name, response, .. } => {
            assert_eq!(name, "read_file");
            assert_eq!(response.status, ToolStatus::Succeeded);
            assert_eq!(response.message, "file body");
        }
        other => panic!("expected tool_response, got {other:?}"),
    }
    // The tool round's raw frames land on the function_calling turn.
    match &session.turns[1] {
        Turn::FunctionCalling { raw_response, .. } => {
            assert!(raw_response.as_deref().unwrap().contains("function_call"));
        }
        other => panic!("expected function_calling, got {other:?}"),
    }
    assert_eq!(session.token_count, 20, "prompt count of the last round");
}

// ── S3: tool-call cap ─────────────────────────────────────────────────────────

#[tokio::test]
async fn tool_call_cap_yields_limit_error_after_exactly_one_pair() {
    let mut settings = Settings::default();
    settings.max_tool_calls = 1;

    let client = Arc::new(ScriptedMockClient::new(vec![
        tool_round("read_file", json!({"file_path": "/missing"}), usage(5, 1, 0)),
        tool_round("read_file", json!({"file_path": "/missing"}), usage(6, 1, 0)),
    ]));
    let (_dir, outcome, session) = run_with(client, settings, new_session_args("go")).await;

    assert_eq!(outcome.final_text, TOOL_LIMIT_TEXT);
    let types = turn_types(&session);
    assert_eq!(
        types,
        vec![
            "user_task",
            "function_calling",
            "tool_response",
            "model_response"
        ],
        "exactly one call/response pair before the limit"
    );
}

#[tokio::test]
async fn zero_cap_rejects_the_first_tool_call_but_allows_text() {
    let mut settings = Settings::default();
    settings.max_tool_calls = 0;

    // Text-only responses still succeed with a zero cap.
    let client = Arc::new(ScriptedMockClient::new(vec![text_round(
        "fine",
        usage(4, 1, 0),
    )]));
    let (_dir, outcome, _) = run_with(client, settings.clone(), new_session_args("a")).await;
    assert_eq!(outcome.final_text, "fine");

    // A tool call ends the loop with the limit error immediately.
    let client = Arc::new(ScriptedMockClient::new(vec![tool_round(
        "read_file",
        json!({"file_path": "/x"}),
        usage(4, 1, 0),
    )]));
    let (_dir, outcome, session) = run_with(client, settings, new_session_args("b")).await;
    assert_eq!(outcome.final_text, TOOL_LIMIT_TEXT);
    assert_eq!(
        turn_types(&session),
        vec!["user_task", "model_response"],
        "no pair is recorded when the cap is zero"
    );
}

// ── Model-stream error boundaries ─────────────────────────────────────────────

#[tokio::test]
async fn empty_stream_returns_canned_text() {
    let client = Arc::new(ScriptedMockClient::new(vec![vec![StreamEvent::Done]]));
    let (_dir, outcome, session) = run_with(
        client,
        Settings::default(),
        new_session_args("hello"),
    )
    .await;

    assert_eq!(outcome.final_text, EMPTY_STREAM_TEXT);
    assert_eq!(outcome.token_count, 0, "no usage metadata was observed");
    assert_eq!(turn_types(&session), vec!["user_task", "model_response"]);
}

#[tokio::test]
async fn thoughts_only_returns_canned_text_but_updates_counters() {
    let client = Arc::new(ScriptedMockClient::new(vec![vec![
        StreamEvent::Text {
            content: "pondering deeply".into(),
            thought: true,
        },
        StreamEvent::Usage(usage(7, 0, 0)),
        StreamEvent::Done,
    ]]));
    let (_dir, outcome, session) = run_with(
        client,
        Settings::default(),
        new_session_args("hmm"),
    )
    .await;

    assert_eq!(outcome.final_text, THOUGHTS_ONLY_TEXT);
    assert_eq!(session.token_count, 7, "counters still written");
}

// ── Failed tool keeps the loop alive ──────────────────────────────────────────

#[tokio::test]
async fn failed_tool_is_recorded_and_loop_continues() {
    let client = Arc::new(ScriptedMockClient::new(vec![
        tool_round(
            "read_file",
            json!({"file_path": "/definitely/not/there"}),
            usage(5, 1, 0),
        ),
        text_round("recovered", usage(9, 2, 0)),
    ]));
    let (_dir, outcome, session) = run_with(
        client,
        Settings::default(),
        new_session_args("try"),
    )
    .await;

    assert_eq!(outcome.final_text, "recovered");
    match &session.turns[2] {
        Turn::ToolResponse { response, .. } => {
            assert_eq!(response.status, ToolStatus::Failed);
        }
        other => panic!("expected tool_response, got {other:?}"),
    }
}

// ── Session busy refusal ──────────────────────────────────────────────────────

#[tokio::test]
async fn resuming_a_running_session_is_refused() {
    let client = Arc::new(ScriptedMockClient::new(vec![text_round(
        "first",
        usage(3, 1, 0),
    )]));
    let (dir, outcome, _) = run_with(
        client,
        Settings::default(),
        new_session_args("one"),
    )
    .await;

    // Simulate a live invocation holding the session.
    let registry = takt_session::ProcessRegistry::new(dir.path());
    registry
        .register(&outcome.session_id, std::process::id())
        .unwrap();

    let settings = Arc::new(Settings::default());
    let client: Arc<dyn ModelClient> = Arc::new(ScriptedMockClient::new(vec![]));
    let runner = TaktRunner::new(settings, dir.path(), client);
    let (tx, _rx) = mpsc::channel(16);
    let err = runner
        .run(
            TaktArgs {
                session: Some(outcome.session_id.clone()),
                instruction: Some("again".into()),
                ..Default::default()
            },
            tx,
        )
        .await
        .unwrap_err();
    let store_err = err.downcast_ref::<takt_session::StoreError>().unwrap();
    assert!(matches!(
        store_err,
        takt_session::StoreError::SessionBusy { .. }
    ));
}

// ── Dry run ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn dry_run_renders_prompt_without_model_call() {
    let client = Arc::new(ScriptedMockClient::new(vec![]));
    let requests = client.requests.clone();
    let mut args = new_session_args("inspect me");
    args.dry_run = true;

    let (_dir, outcome, _) = run_with(client, Settings::default(), args).await;
    assert!(outcome.final_text.contains("# Agent Session"));
    assert!(outcome.final_text.contains("demo"));
    assert!(requests.lock().unwrap().is_empty(), "no model call on dry run");
}

// ── Identity-flag validation ──────────────────────────────────────────────────

#[tokio::test]
async fn session_flag_conflicts_with_identity_flags() {
    let settings = Arc::new(Settings::default());
    let dir = tempfile::tempdir().unwrap();
    let client: Arc<dyn ModelClient> = Arc::new(ScriptedMockClient::new(vec![]));
    let runner = TaktRunner::new(settings, dir.path(), client);
    let (tx, _rx) = mpsc::channel(16);
    let err = runner
        .run(
            TaktArgs {
                session: Some("abc".into()),
                purpose: Some("p".into()),
                ..Default::default()
            },
            tx,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("--session"));
}
