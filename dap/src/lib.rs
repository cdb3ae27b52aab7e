//! Step-debugger client for the tool's `--dap` mode.

mod client;
mod protocol;
pub mod types;

pub use client::DapClient;
pub use types::{
    Breakpoint, Capabilities, DapEvent, DapEventKind, DebuggerConfig, EvaluateResult,
    LaunchRequest, OutputEvent, Scope, Source, SourceBreakpoint, StackFrame, StoppedEvent, Thread,
    Variable,
};
