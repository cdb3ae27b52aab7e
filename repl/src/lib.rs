//! Read-eval-print client for the tool's `--repl` mode.
//!
//! The evaluator speaks plain text terminated by its prompt; see
//! [`qalam_rpc::PromptDecoder`] for how turns are framed and classified.

mod client;
mod types;

pub use client::ReplClient;
pub use qalam_rpc::{EvalOutcome, PromptSyntax};
pub use types::{ReplConfig, ReplEvent, ReplEventKind};
