//! Typed request arguments, response bodies, and events.
//!
//! Only the fields the client acts on are modelled; everything is
//! deserialized leniently so adapters that omit optional fields still work.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use qalam_rpc::{BusEvent, StopReason};

/// How to launch and talk to the debug adapter.
#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    pub command: String,
    /// Arguments selecting the stdio debug-adapter mode.
    pub args: Vec<String>,
    /// `adapterID` sent with `initialize`.
    pub adapter_id: String,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            command: String::from("tarqeem"),
            args: vec![String::from("--dap")],
            adapter_id: String::from("tarqeem"),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// What the adapter declared in its `initialize` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub supports_configuration_done_request: bool,
    pub supports_restart_request: bool,
    pub supports_terminate_request: bool,
    pub supports_conditional_breakpoints: bool,
    pub supports_evaluate_for_hovers: bool,
    pub supports_step_back: bool,
}

/// Arguments of `launch`. `extra` is merged in for adapter-specific keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stop_on_entry: bool,
    pub no_debug: bool,
    pub extra: serde_json::Map<String, Value>,
}

impl LaunchRequest {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub(crate) fn to_arguments(&self) -> Value {
        let mut args = self.extra.clone();
        args.insert(
            "program".to_string(),
            Value::String(self.program.display().to_string()),
        );
        args.insert(
            "args".to_string(),
            Value::Array(self.args.iter().cloned().map(Value::String).collect()),
        );
        if let Some(cwd) = &self.cwd {
            args.insert("cwd".to_string(), Value::String(cwd.display().to_string()));
        }
        args.insert("stopOnEntry".to_string(), Value::Bool(self.stop_on_entry));
        args.insert("noDebug".to_string(), Value::Bool(self.no_debug));
        Value::Object(args)
    }
}

/// One entry of `setBreakpoints.arguments.breakpoints`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceBreakpoint {
    /// 1-based line.
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl SourceBreakpoint {
    #[must_use]
    pub fn at(line: u32) -> Self {
        Self {
            line,
            condition: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Breakpoint {
    pub id: Option<i64>,
    pub verified: bool,
    pub line: Option<u32>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Source {
    pub name: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub source: Option<Source>,
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    pub variables_reference: i64,
    #[serde(default)]
    pub expensive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(default, rename = "type")]
    pub type_name: Option<String>,
    /// Non-zero when the variable has children.
    #[serde(default)]
    pub variables_reference: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub result: String,
    #[serde(default, rename = "type")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEvent {
    /// `step`, `breakpoint`, `exception`, `pause`, `entry`, ...
    pub reason: String,
    #[serde(default)]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub all_threads_stopped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputEvent {
    /// `console`, `stdout`, `stderr`, ...; adapters may omit it.
    #[serde(default)]
    pub category: Option<String>,
    pub output: String,
}

/// Something the adapter pushed, or the end of the session.
#[derive(Debug, Clone)]
pub enum DapEvent {
    Initialized,
    Stopped(StoppedEvent),
    Continued {
        thread_id: Option<i64>,
    },
    Output(OutputEvent),
    Breakpoint {
        reason: String,
        breakpoint: Breakpoint,
    },
    Thread {
        reason: String,
        thread_id: i64,
    },
    Terminated,
    Exited {
        exit_code: i64,
    },
    /// Any event without a typed variant.
    Other {
        event: String,
        body: Option<Value>,
    },
    /// The adapter process is gone. Published once per session.
    SessionEnded {
        reason: StopReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DapEventKind {
    Initialized,
    Stopped,
    Continued,
    Output,
    Breakpoint,
    Thread,
    Terminated,
    Exited,
    Other,
    SessionEnded,
}

impl BusEvent for DapEvent {
    type Kind = DapEventKind;

    fn kind(&self) -> DapEventKind {
        match self {
            Self::Initialized => DapEventKind::Initialized,
            Self::Stopped(_) => DapEventKind::Stopped,
            Self::Continued { .. } => DapEventKind::Continued,
            Self::Output(_) => DapEventKind::Output,
            Self::Breakpoint { .. } => DapEventKind::Breakpoint,
            Self::Thread { .. } => DapEventKind::Thread,
            Self::Terminated => DapEventKind::Terminated,
            Self::Exited { .. } => DapEventKind::Exited,
            Self::Other { .. } => DapEventKind::Other,
            Self::SessionEnded { .. } => DapEventKind::SessionEnded,
        }
    }
}

impl DapEvent {
    /// Build the typed event for `event`. Bodies that do not match the
    /// expected shape fall back to [`DapEvent::Other`].
    pub(crate) fn from_wire(event: &str, body: Option<Value>) -> Self {
        fn field<T: serde::de::DeserializeOwned>(body: Option<&Value>, key: &str) -> Option<T> {
            serde_json::from_value(body?.get(key)?.clone()).ok()
        }

        let typed = match event {
            "initialized" => Some(Self::Initialized),
            "terminated" => Some(Self::Terminated),
            "stopped" => body
                .clone()
                .and_then(|b| serde_json::from_value(b).ok())
                .map(Self::Stopped),
            "output" => body
                .clone()
                .and_then(|b| serde_json::from_value(b).ok())
                .map(Self::Output),
            "continued" => Some(Self::Continued {
                thread_id: field(body.as_ref(), "threadId"),
            }),
            "breakpoint" => match (
                field(body.as_ref(), "reason"),
                field(body.as_ref(), "breakpoint"),
            ) {
                (Some(reason), Some(breakpoint)) => Some(Self::Breakpoint { reason, breakpoint }),
                _ => None,
            },
            "thread" => match (
                field(body.as_ref(), "reason"),
                field(body.as_ref(), "threadId"),
            ) {
                (Some(reason), Some(thread_id)) => Some(Self::Thread { reason, thread_id }),
                _ => None,
            },
            "exited" => field(body.as_ref(), "exitCode").map(|exit_code| Self::Exited { exit_code }),
            _ => None,
        };

        typed.unwrap_or_else(|| Self::Other {
            event: event.to_string(),
            body,
        })
    }
}
