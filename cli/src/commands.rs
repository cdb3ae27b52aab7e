//! Subcommand drivers. Each one borrows its client from the registry and
//! leaves stopping it to [`ClientRegistry::dispose`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use qalam_dap::{DapClient, DapEvent, LaunchRequest, SourceBreakpoint, StoppedEvent};
use qalam_repl::EvalOutcome;

use crate::registry::ClientRegistry;

fn absolute(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn print_outcome(outcome: &EvalOutcome) {
    if !outcome.output.is_empty() {
        println!("{}", outcome.output);
    }
    if let Some(value) = &outcome.return_value {
        println!("=> {value}");
    }
    if let Some(error) = &outcome.error {
        eprintln!("{error}");
    }
}

pub(crate) async fn repl(registry: &ClientRegistry, working_dir: &Path) -> Result<ExitCode> {
    let client = registry.repl()?;
    let _output = client.on_output(|text| println!("{text}"));
    let _stderr = client.on_stderr(|text| eprint!("{text}"));
    client
        .start(working_dir)
        .await
        .context("failed to start the evaluator")?;

    let exit_command = client.config().exit_command.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == exit_command {
            break;
        }
        match client.evaluate(line).await {
            Ok(outcome) => print_outcome(&outcome),
            Err(err) if client.is_running() => eprintln!("{err}"),
            Err(err) => return Err(err).context("evaluator stopped"),
        }
    }

    Ok(ExitCode::SUCCESS)
}

pub(crate) async fn eval(
    registry: &ClientRegistry,
    working_dir: &Path,
    file: &Path,
) -> Result<ExitCode> {
    let file = absolute(working_dir, file);
    let source = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let client = registry.repl()?;
    client
        .start(working_dir)
        .await
        .context("failed to start the evaluator")?;
    let outcome = client
        .evaluate(&source)
        .await
        .with_context(|| format!("failed to evaluate {}", file.display()))?;

    print_outcome(&outcome);
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub(crate) async fn check(
    registry: &ClientRegistry,
    working_dir: &Path,
    file: &Path,
    wait: Duration,
) -> Result<ExitCode> {
    let file = std::fs::canonicalize(absolute(working_dir, file))
        .with_context(|| format!("failed to resolve {}", file.display()))?;
    let text = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    // Diagnostics outside the workspace root are dropped, so fall back to
    // the file's own directory.
    let mut root = std::fs::canonicalize(working_dir)
        .with_context(|| format!("failed to resolve {}", working_dir.display()))?;
    if !file.starts_with(&root)
        && let Some(parent) = file.parent()
    {
        root = parent.to_path_buf();
    }

    let client = registry.lsp();
    let (published_tx, mut published_rx) = mpsc::unbounded_channel();
    let target = file.clone();
    let _diagnostics = client.on_diagnostics(move |path, _| {
        if path == target {
            let _ = published_tx.send(());
        }
    });
    let _log = client.on_log(|level, message| tracing::debug!(?level, "server: {message}"));

    client
        .start(&root)
        .await
        .context("failed to start the language server")?;
    client.did_change(&file, &text).await?;

    if tokio::time::timeout(wait, published_rx.recv()).await.is_err() {
        tracing::info!(path = %file.display(), "No diagnostics published within {wait:?}");
    }

    let snapshot = client.diagnostics_snapshot();
    let items = snapshot.for_path(&file).unwrap_or_default();
    for diagnostic in items {
        println!("{}", diagnostic.display_with_path(&file));
    }
    let errors = items.iter().filter(|d| d.severity().is_error()).count();
    println!(
        "{}: {} error(s), {} other",
        file.display(),
        errors,
        items.len() - errors
    );

    Ok(if errors == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub(crate) struct DebugRun {
    pub(crate) program: PathBuf,
    pub(crate) breakpoints: Vec<(PathBuf, u32)>,
    pub(crate) stop_on_entry: bool,
    pub(crate) args: Vec<String>,
}

fn group_breakpoints(
    working_dir: &Path,
    breakpoints: &[(PathBuf, u32)],
) -> BTreeMap<PathBuf, Vec<SourceBreakpoint>> {
    let mut by_file: BTreeMap<PathBuf, Vec<SourceBreakpoint>> = BTreeMap::new();
    for (file, line) in breakpoints {
        by_file
            .entry(absolute(working_dir, file))
            .or_default()
            .push(SourceBreakpoint::at(*line));
    }
    by_file
}

pub(crate) async fn debug(
    registry: &ClientRegistry,
    working_dir: &Path,
    run: DebugRun,
) -> Result<ExitCode> {
    let client = registry.dap();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let _events = client.on_event(move |event: &DapEvent| {
        let _ = events_tx.send(event.clone());
    });

    client
        .start(working_dir)
        .await
        .context("failed to start the debug adapter")?;

    for (file, breakpoints) in group_breakpoints(working_dir, &run.breakpoints) {
        let placed = client
            .set_breakpoints(&file, &breakpoints)
            .await
            .with_context(|| format!("failed to set breakpoints in {}", file.display()))?;
        for (requested, bp) in breakpoints.iter().zip(&placed) {
            if !bp.verified {
                eprintln!(
                    "breakpoint {}:{} not verified{}",
                    file.display(),
                    requested.line,
                    bp.message
                        .as_deref()
                        .map(|m| format!(": {m}"))
                        .unwrap_or_default()
                );
            }
        }
    }

    let mut launch = LaunchRequest::new(absolute(working_dir, &run.program));
    launch.args = run.args;
    launch.cwd = Some(working_dir.to_path_buf());
    launch.stop_on_entry = run.stop_on_entry;
    client.launch(launch).await.context("launch failed")?;

    let mut exit_code = None;
    while let Some(event) = events_rx.recv().await {
        match event {
            DapEvent::Output(output) => {
                if output.category.as_deref() == Some("stderr") {
                    eprint!("{}", output.output);
                } else {
                    print!("{}", output.output);
                }
            }
            DapEvent::Stopped(stopped) => report_and_resume(client, &stopped).await?,
            DapEvent::Exited { exit_code: code } => exit_code = Some(code),
            DapEvent::Terminated => break,
            DapEvent::SessionEnded { reason } => {
                tracing::info!(%reason, "Debug session ended");
                break;
            }
            _ => {}
        }
    }

    Ok(match exit_code {
        Some(code) => u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from),
        None => ExitCode::SUCCESS,
    })
}

/// Print where execution stopped, then continue.
async fn report_and_resume(client: &DapClient, stopped: &StoppedEvent) -> Result<()> {
    let thread_id = match stopped.thread_id {
        Some(id) => id,
        None => match client.threads().await?.first() {
            Some(thread) => thread.id,
            None => return Ok(()),
        },
    };

    let mut line = format!("stopped: {} (thread {thread_id})", stopped.reason);
    if let Some(text) = stopped.description.as_ref().or(stopped.text.as_ref()) {
        line.push_str(&format!(" {text}"));
    }
    println!("{line}");

    match client.stack_trace(thread_id).await {
        Ok(frames) => {
            if let Some(frame) = frames.first() {
                let source = frame
                    .source
                    .as_ref()
                    .and_then(|s| s.path.as_deref().or(s.name.as_deref()))
                    .unwrap_or("<unknown>");
                println!("    at {} ({}:{})", frame.name, source, frame.line);
            }
        }
        Err(err) => tracing::warn!("stackTrace failed: {err}"),
    }

    client.continue_execution(thread_id).await?;
    Ok(())
}
