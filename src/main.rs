// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::filter::EnvFilter;

use cli::{Cli, Commands, OutputFormatArg};
use takt_core::{
    find_project_root, AgentEvent, OutputFormat, TaktArgs, TaktRunner,
};
use takt_model::{ModelClient, RestClient, ScriptedMockClient};
use takt_pipeline::SerialPipelineExecutor;
use takt_session::SessionService;

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let project_root = find_project_root()?;
    let settings = Arc::new(takt_config::load(cli.config.as_deref())?);

    if let Some(command) = &cli.command {
        match command {
            Commands::Serial { parent_session } => {
                let executor = SerialPipelineExecutor::new(&project_root);
                let parent = parent_session.clone();
                // The pipeline is sequential blocking subprocess work.
                let code =
                    tokio::task::spawn_blocking(move || executor.run(&parent)).await??;
                return Ok(code);
            }
            Commands::Sessions => {
                let sessions =
                    SessionService::new(project_root.join("sessions"), &settings)?;
                for (id, overview) in sessions.list_sessions()? {
                    println!(
                        "{id}  {}  {}",
                        overview.last_updated,
                        overview.purpose.as_deref().unwrap_or("-"),
                    );
                }
                return Ok(0);
            }
            Commands::Fork { session, at } => {
                let sessions =
                    SessionService::new(project_root.join("sessions"), &settings)?;
                let forked = sessions.fork_session(session, *at)?;
                println!("{forked}");
                return Ok(0);
            }
            Commands::Delete { session } => {
                let sessions =
                    SessionService::new(project_root.join("sessions"), &settings)?;
                sessions.delete_session(session)?;
                return Ok(0);
            }
        }
    }

    let client = build_client(&settings)?;
    let runner = TaktRunner::new(settings.clone(), &project_root, client);

    let output_format = cli.output_format;
    let args = TaktArgs {
        session: cli.session.clone(),
        purpose: cli.purpose.clone(),
        background: cli.background.clone(),
        roles: cli.roles.clone(),
        procedure: cli.procedure.clone(),
        parent_session: cli.parent_session.clone(),
        instruction: cli.instruction.clone(),
        references: cli.references.clone(),
        artifacts: cli.artifacts.clone(),
        multi_step_reasoning: cli.multi_step_reasoning,
        output_format: match output_format {
            OutputFormatArg::Text => OutputFormat::Text,
            OutputFormatArg::Json => OutputFormat::Json,
        },
        dry_run: cli.dry_run,
    };
    let dry_run = args.dry_run;

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::TextDelta(text) => {
                    let _ = write!(stdout, "{text}");
                    let _ = stdout.flush();
                }
                AgentEvent::ToolCallStarted { display, .. }
                | AgentEvent::ToolCallFinished { display, .. } => {
                    let _ = write!(stdout, "{display}");
                    let _ = stdout.flush();
                }
                _ => {}
            }
        }
    });

    let outcome = runner.run(args, tx).await?;
    printer.await.context("stdout printer task failed")?;

    if dry_run {
        println!("{}", outcome.final_text);
    } else {
        println!();
    }

    match output_format {
        OutputFormatArg::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "session_id": outcome.session_id,
                    "token_count": outcome.token_count,
                    "created": outcome.created,
                })
            );
        }
        OutputFormatArg::Text => {
            println!("session: {}", outcome.session_id);
        }
    }

    Ok(0)
}

fn build_client(settings: &Arc<takt_config::Settings>) -> anyhow::Result<Arc<dyn ModelClient>> {
    match settings.model.provider.as_str() {
        "mock" => Ok(Arc::new(ScriptedMockClient::new(vec![]))),
        "rest" => {
            let base_url = settings
                .model
                .base_url
                .clone()
                .context("model.base_url is required for the rest provider")?;
            let api_key = settings
                .model
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            Ok(Arc::new(RestClient::new(
                base_url,
                settings.model.name.clone(),
                api_key,
            )))
        }
        other => anyhow::bail!("unknown model provider '{other}'"),
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_env("TAKT_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
