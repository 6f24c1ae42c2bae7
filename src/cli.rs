// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Output format for the identity line printed after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormatArg {
    /// Human-readable `session: <id>` line.
    #[default]
    Text,
    /// Single-line JSON object containing `session_id`, for subprocess
    /// callers (the serial executor runs agent tasks with this format).
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute the serial task pipeline for a parent session.
    ///
    /// Reads `.pipe_sessions/<parent>_tasks.json`, runs the agent and script
    /// tasks in order with retry-with-backtrack on script failure, writes the
    /// result file, and resumes the parent session with a completion
    /// instruction. Exit codes: 0 success, 1 soft failure, 2 permanent abort.
    Serial {
        /// Parent session id whose task list should be executed.
        #[arg(long)]
        parent_session: String,
    },

    /// List known sessions from the index.
    Sessions,

    /// Fork an existing session at a model-response turn.
    Fork {
        /// Session id to fork.
        #[arg(long)]
        session: String,
        /// 0-based index of the model_response turn to fork at.
        #[arg(long)]
        at: usize,
    },

    /// Delete a session, its children, and its backups.
    Delete {
        /// Session id to delete.
        #[arg(long)]
        session: String,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = "takt",
    about = "A session-oriented orchestration runtime for LLM agents",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Purpose of a new session.
    #[arg(long, conflicts_with = "session")]
    pub purpose: Option<String>,

    /// Background of a new session.
    #[arg(long, conflicts_with = "session")]
    pub background: Option<String>,

    /// Role document path; may be given multiple times.
    #[arg(long = "roles", conflicts_with = "session")]
    pub roles: Vec<String>,

    /// Procedure document path for a new session.
    #[arg(long, conflicts_with = "session")]
    pub procedure: Option<String>,

    /// Create the new session as a child of this session id.
    #[arg(long, conflicts_with = "session")]
    pub parent_session: Option<String>,

    /// Resume an existing session.
    #[arg(long)]
    pub session: Option<String>,

    /// Append a user_task turn and run one agent invocation.
    #[arg(long)]
    pub instruction: Option<String>,

    /// File reference to attach to the session; may be given multiple times.
    #[arg(long = "references")]
    pub references: Vec<String>,

    /// Artifact path whose content is attached; may be given multiple times.
    #[arg(long = "artifacts")]
    pub artifacts: Vec<String>,

    /// Enable multi-step reasoning on the session.
    #[arg(long)]
    pub multi_step_reasoning: bool,

    /// Identity line format on stdout.
    #[arg(long, value_enum, default_value = "text")]
    pub output_format: OutputFormatArg,

    /// Assemble the prompt and print it instead of calling the model.
    #[arg(long)]
    pub dry_run: bool,

    /// Explicit config file path (merged over the discovered layers).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Increase stderr logging verbosity (-v info, -vv debug).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}
