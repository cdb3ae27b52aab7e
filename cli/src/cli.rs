//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "qalam", version, disable_help_subcommand = true)]
pub(crate) struct Cli {
    /// Overrides `[tool] working_dir` from the config file.
    #[arg(long, global = true, value_name = "DIR")]
    pub(crate) working_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum CliCommand {
    /// Evaluates lines typed on stdin until end of input.
    Repl,
    /// Evaluates one source file and prints its result.
    Eval {
        file: PathBuf,
    },
    /// Opens a file with the language server and prints its diagnostics.
    Check {
        file: PathBuf,
        /// How long to wait for the server to publish diagnostics.
        #[arg(long, default_value_t = 5_000, value_name = "MS")]
        wait_ms: u64,
    },
    /// Runs a program under the debugger, printing stops and output.
    Debug {
        program: PathBuf,
        /// Breakpoint as `FILE:LINE`. Repeatable.
        #[arg(long = "break", value_name = "FILE:LINE", value_parser = parse_breakpoint)]
        breakpoints: Vec<(PathBuf, u32)>,
        #[arg(long)]
        stop_on_entry: bool,
        /// Arguments passed to the program.
        #[arg(
            value_name = "ARG",
            num_args = 0..,
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        args: Vec<String>,
    },
}

fn parse_breakpoint(raw: &str) -> Result<(PathBuf, u32), String> {
    let (file, line) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("expected FILE:LINE, got `{raw}`"))?;
    if file.is_empty() {
        return Err(format!("missing file in `{raw}`"));
    }
    let line: u32 = line
        .parse()
        .map_err(|_| format!("invalid line number `{line}`"))?;
    if line == 0 {
        return Err("line numbers start at 1".to_string());
    }
    Ok((PathBuf::from(file), line))
}
