use std::time::Duration;

use qalam_rpc::{BusEvent, PromptSyntax, StopReason};

/// How to launch and drive the evaluator.
#[derive(Debug, Clone)]
pub struct ReplConfig {
    pub command: String,
    /// Arguments selecting the interactive mode.
    pub args: Vec<String>,
    pub syntax: PromptSyntax,
    /// Sentinels the evaluator's grammar requires around a submitted block.
    /// Both must be set for wrapping to apply.
    pub block_start: Option<String>,
    pub block_end: Option<String>,
    /// Line sent on `stop()` to ask the evaluator to quit.
    pub exit_command: String,
    /// Bound on waiting for the first prompt.
    pub startup_timeout: Duration,
    pub eval_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            command: String::from("tarqeem"),
            args: vec![String::from("--repl")],
            syntax: PromptSyntax::default(),
            block_start: Some(String::from("بداية")),
            block_end: Some(String::from("نهاية")),
            exit_command: String::from("خروج"),
            startup_timeout: Duration::from_secs(10),
            eval_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Something the evaluator produced outside an evaluation.
#[derive(Debug, Clone)]
pub enum ReplEvent {
    /// A completed turn nobody was waiting for.
    Output(String),
    /// Error-stream text received while idle.
    Stderr(String),
    /// The session ended. Published once per session.
    Stopped { reason: StopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplEventKind {
    Output,
    Stderr,
    Stopped,
}

impl BusEvent for ReplEvent {
    type Kind = ReplEventKind;

    fn kind(&self) -> ReplEventKind {
        match self {
            Self::Output(_) => ReplEventKind::Output,
            Self::Stderr(_) => ReplEventKind::Stderr,
            Self::Stopped { .. } => ReplEventKind::Stopped,
        }
    }
}
