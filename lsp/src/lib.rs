//! Language-intelligence client for the tool's `--lsp` mode.
//!
//! [`LspClient`] spawns the server, negotiates capabilities, exposes
//! `request`/`notify` plus a few typed helpers, and keeps the latest
//! published diagnostics per file.

mod client;
mod diagnostics;
mod protocol;
pub mod types;

pub use client::LspClient;
pub use types::{
    Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot, Location, LspEvent, LspEventKind,
    MessageLevel, ServerConfig,
};
