//! qalam - command-line front end for the tarqeem language tool.
//!
//! Every subcommand drives one of the stdio protocol clients:
//!
//! ```text
//! qalam repl | eval  -> ReplClient (tarqeem --repl)
//! qalam check        -> LspClient  (tarqeem --lsp)
//! qalam debug        -> DapClient  (tarqeem --dap)
//! ```
//!
//! Clients live in a [`registry::ClientRegistry`] that is disposed before
//! exit, including on Ctrl-C, so no child process outlives the binary.

mod cli;
mod commands;
mod registry;

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Mutex,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use qalam_config::QalamConfig;

use crate::cli::{Cli, CliCommand};
use crate::commands::DebugRun;
use crate::registry::ClientRegistry;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries command output; logs go to stderr instead.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.qalam/logs/qalam.log
    if let Some(config_path) = QalamConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("qalam.log"));
    }

    candidates.push(PathBuf::from(".qalam").join("logs").join("qalam.log"));

    candidates
}

async fn run(registry: &ClientRegistry, command: CliCommand, working_dir: &Path) -> Result<ExitCode> {
    match command {
        CliCommand::Repl => commands::repl(registry, working_dir).await,
        CliCommand::Eval { file } => commands::eval(registry, working_dir, &file).await,
        CliCommand::Check { file, wait_ms } => {
            commands::check(registry, working_dir, &file, Duration::from_millis(wait_ms)).await
        }
        CliCommand::Debug {
            program,
            breakpoints,
            stop_on_entry,
            args,
        } => {
            let run = DebugRun {
                program,
                breakpoints,
                stop_on_entry,
                args,
            };
            commands::debug(registry, working_dir, run).await
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    let config = QalamConfig::load()
        .context("failed to load config")?
        .unwrap_or_default();
    let working_dir = match cli.working_dir {
        Some(dir) => dir,
        None => config.working_dir()?,
    };
    let working_dir = std::path::absolute(&working_dir)
        .with_context(|| format!("invalid working directory {}", working_dir.display()))?;
    tracing::debug!(command = %command_name(&cli.command), dir = %working_dir.display(), "Starting");

    let registry = ClientRegistry::new(config);
    let result = tokio::select! {
        result = run(&registry, cli.command, &working_dir) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(ExitCode::from(130))
        }
    };

    registry.dispose().await;
    result
}

fn command_name(command: &CliCommand) -> &'static str {
    match command {
        CliCommand::Repl => "repl",
        CliCommand::Eval { .. } => "eval",
        CliCommand::Check { .. } => "check",
        CliCommand::Debug { .. } => "debug",
    }
}
