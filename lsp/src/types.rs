//! Public types of the language-intelligence client.
//!
//! Callers construct a [`ServerConfig`], subscribe to [`LspEvent`]s, and read
//! [`DiagnosticsSnapshot`]s for display.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use qalam_rpc::{BusEvent, StopReason};

/// How to launch and talk to the language server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Executable resolved on `PATH` (e.g. "tarqeem").
    pub command: String,
    /// Arguments selecting the stdio language-server mode.
    pub args: Vec<String>,
    /// `languageId` sent with `textDocument/didOpen`.
    pub language_id: String,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// How long `stop()` waits for a voluntary exit before killing.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: String::from("tarqeem"),
            args: vec![String::from("--lsp")],
            language_id: String::from("tarqeem"),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range; the caller
    /// picks the fallback.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    line: u32,
    col: u32,
    source: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: String,
        line: u32,
        col: u32,
        source: String,
    ) -> Self {
        Self {
            severity,
            message,
            line,
            col,
            source,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 0-indexed line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// 0-indexed column.
    #[must_use]
    pub fn col(&self) -> u32 {
        self.col
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Format as `path:line:col: severity: [source] message`, 1-indexed.
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.line + 1,
            self.col + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// A position in a file, as returned by `textDocument/definition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    path: PathBuf,
    line: u32,
    character: u32,
}

impl Location {
    #[must_use]
    pub fn new(path: PathBuf, line: u32, character: u32) -> Self {
        Self {
            path,
            line,
            character,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[must_use]
    pub fn character(&self) -> u32 {
        self.character
    }
}

/// `MessageType` of `window/logMessage` and `window/showMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Error,
    Warning,
    Info,
    Log,
}

impl MessageLevel {
    pub(crate) fn from_lsp(value: u64) -> Self {
        match value {
            1 => Self::Error,
            2 => Self::Warning,
            3 => Self::Info,
            _ => Self::Log,
        }
    }
}

/// Something the server pushed without being asked.
#[derive(Debug, Clone)]
pub enum LspEvent {
    /// Diagnostics replaced for one file. An empty list clears the file.
    Diagnostics {
        path: PathBuf,
        items: Vec<Diagnostic>,
    },
    /// `window/logMessage`.
    LogMessage { level: MessageLevel, message: String },
    /// `window/showMessage`.
    ShowMessage { level: MessageLevel, message: String },
    /// Any other notification, passed through untyped.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// The session ended. Published once per session.
    Stopped { reason: StopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LspEventKind {
    Diagnostics,
    LogMessage,
    ShowMessage,
    Notification,
    Stopped,
}

impl BusEvent for LspEvent {
    type Kind = LspEventKind;

    fn kind(&self) -> LspEventKind {
        match self {
            Self::Diagnostics { .. } => LspEventKind::Diagnostics,
            Self::LogMessage { .. } => LspEventKind::LogMessage,
            Self::ShowMessage { .. } => LspEventKind::ShowMessage,
            Self::Notification { .. } => LspEventKind::Notification,
            Self::Stopped { .. } => LspEventKind::Stopped,
        }
    }
}

/// Immutable snapshot of all diagnostics.
///
/// Counts are computed from `files`, never cached.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-file diagnostics, sorted with error-containing files first.
    files: Vec<(PathBuf, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: Vec<(PathBuf, Vec<Diagnostic>)>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[(PathBuf, Vec<Diagnostic>)] {
        &self.files
    }

    /// Diagnostics for one file, if any were reported.
    #[must_use]
    pub fn for_path(&self, path: &Path) -> Option<&[Diagnostic]> {
        self.files
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, items)| items.as_slice())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Compact status such as `E:3 W:5`; empty when there is nothing.
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
