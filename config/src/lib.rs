//! `~/.qalam/config.toml` loading.
//!
//! Every key is optional. A missing file is not an error: callers fall back
//! to [`QalamConfig::default`], whose values match the clients' own
//! defaults.
//!
//! ```toml
//! [tool]
//! command = "${HOME}/.local/bin/tarqeem"
//!
//! [repl]
//! eval_timeout_ms = 60000
//! error_markers = ["خطأ", "Error", "Fehler"]
//! ```

use std::path::{Path, PathBuf};
use std::{env, fs};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use qalam_dap::DebuggerConfig;
use qalam_lsp::ServerConfig;
use qalam_repl::{PromptSyntax, ReplConfig};
use qalam_rpc::codec::prompt::{DEFAULT_BANNER, DEFAULT_ERROR_MARKERS, DEFAULT_PROMPT};

const DEFAULT_COMMAND: &str = "tarqeem";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QalamConfig {
    pub tool: ToolConfig,
    pub lsp: LspSection,
    pub debugger: DebuggerSection,
    pub repl: ReplSection,
}

/// The external tool shared by all three clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub command: String,
    /// Workspace root for the language server and cwd for the debugger.
    /// Defaults to the current directory.
    pub working_dir: Option<PathBuf>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LspSection {
    pub args: Vec<String>,
    pub language_id: String,
    pub request_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for LspSection {
    fn default() -> Self {
        Self {
            args: vec!["--lsp".to_string()],
            language_id: DEFAULT_COMMAND.to_string(),
            request_timeout_ms: 30_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebuggerSection {
    pub args: Vec<String>,
    pub adapter_id: String,
    pub request_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for DebuggerSection {
    fn default() -> Self {
        Self {
            args: vec!["--dap".to_string()],
            adapter_id: DEFAULT_COMMAND.to_string(),
            request_timeout_ms: 30_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplSection {
    pub args: Vec<String>,
    pub startup_timeout_ms: u64,
    pub eval_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub prompt: String,
    /// Empty disables banner stripping.
    pub banner: String,
    pub error_markers: Vec<String>,
    /// Empty disables block wrapping.
    pub block_start: String,
    pub block_end: String,
    pub exit_command: String,
}

impl Default for ReplSection {
    fn default() -> Self {
        Self {
            args: vec!["--repl".to_string()],
            startup_timeout_ms: 10_000,
            eval_timeout_ms: 30_000,
            shutdown_grace_ms: 1_000,
            prompt: DEFAULT_PROMPT.to_string(),
            banner: DEFAULT_BANNER.to_string(),
            error_markers: DEFAULT_ERROR_MARKERS
                .iter()
                .map(ToString::to_string)
                .collect(),
            block_start: "بداية".to_string(),
            block_end: "نهاية".to_string(),
            exit_command: "خروج".to_string(),
        }
    }
}

/// Replace `${VAR}` with the variable's value (empty when unset).
/// An unclosed `${` is kept as written.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(open) = rest.find("${") {
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..open]);
        let var = &after[..close];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

fn expand_all(values: &mut [String]) {
    for value in values {
        *value = expand_env_vars(value);
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl QalamConfig {
    /// Load from [`config_path`]. `Ok(None)` when there is no file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {:?}: {}", path, source);
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let mut config: Self = toml::from_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, source);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        config.expand_env();
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(Some(config))
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    fn expand_env(&mut self) {
        let tool = &mut self.tool;
        tool.command = expand_env_vars(&tool.command);
        if let Some(dir) = &tool.working_dir {
            tool.working_dir = Some(PathBuf::from(expand_env_vars(&dir.to_string_lossy())));
        }

        expand_all(&mut self.lsp.args);
        expand_all(&mut self.debugger.args);

        let repl = &mut self.repl;
        expand_all(&mut repl.args);
        expand_all(std::slice::from_mut(&mut repl.prompt));
        expand_all(std::slice::from_mut(&mut repl.banner));
        expand_all(&mut repl.error_markers);
    }

    pub fn lsp_config(&self) -> ServerConfig {
        ServerConfig {
            command: self.tool.command.clone(),
            args: self.lsp.args.clone(),
            language_id: self.lsp.language_id.clone(),
            request_timeout: Duration::from_millis(self.lsp.request_timeout_ms),
            shutdown_grace: Duration::from_millis(self.lsp.shutdown_grace_ms),
        }
    }

    pub fn debugger_config(&self) -> DebuggerConfig {
        DebuggerConfig {
            command: self.tool.command.clone(),
            args: self.debugger.args.clone(),
            adapter_id: self.debugger.adapter_id.clone(),
            request_timeout: Duration::from_millis(self.debugger.request_timeout_ms),
            shutdown_grace: Duration::from_millis(self.debugger.shutdown_grace_ms),
        }
    }

    pub fn repl_config(&self) -> anyhow::Result<ReplConfig> {
        let repl = &self.repl;
        let syntax = PromptSyntax::new(
            repl.prompt.clone(),
            non_empty(&repl.banner),
            &repl.error_markers,
        )
        .context("invalid [repl] error_markers")?;

        Ok(ReplConfig {
            command: self.tool.command.clone(),
            args: repl.args.clone(),
            syntax,
            block_start: non_empty(&repl.block_start),
            block_end: non_empty(&repl.block_end),
            exit_command: repl.exit_command.clone(),
            startup_timeout: Duration::from_millis(repl.startup_timeout_ms),
            eval_timeout: Duration::from_millis(repl.eval_timeout_ms),
            shutdown_grace: Duration::from_millis(repl.shutdown_grace_ms),
        })
    }

    /// `[tool] working_dir`, or the current directory.
    pub fn working_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.tool.working_dir {
            Some(dir) => Ok(dir.clone()),
            None => env::current_dir().context("failed to read the current directory"),
        }
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".qalam").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            std::env::set_var("QALAM_TEST_SINGLE", "replaced");
        }
        let result = expand_env_vars("prefix ${QALAM_TEST_SINGLE} suffix");
        assert_eq!(result, "prefix replaced suffix");
        unsafe {
            std::env::remove_var("QALAM_TEST_SINGLE");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            std::env::remove_var("QALAM_TEST_MISSING");
        }
        let result = expand_env_vars("before ${QALAM_TEST_MISSING} after");
        assert_eq!(result, "before  after");
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
    }

    #[test]
    fn expand_env_vars_empty_name_dropped() {
        assert_eq!(expand_env_vars("test ${} more"), "test  more");
    }

    #[test]
    fn expand_env_vars_arabic_text_untouched() {
        unsafe {
            std::env::set_var("QALAM_TEST_ARABIC", "ترقيم");
        }
        let result = expand_env_vars("خطأ ${QALAM_TEST_ARABIC}> ");
        assert_eq!(result, "خطأ ترقيم> ");
        unsafe {
            std::env::remove_var("QALAM_TEST_ARABIC");
        }
    }

    #[test]
    fn load_from_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = QalamConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_from_empty_file_uses_defaults() {
        let (_dir, path) = write_config("");
        let config = QalamConfig::load_from(&path).unwrap().unwrap();

        let lsp = config.lsp_config();
        assert_eq!(lsp.command, "tarqeem");
        assert_eq!(lsp.args, vec!["--lsp"]);
        assert_eq!(lsp.request_timeout, Duration::from_secs(30));

        let dap = config.debugger_config();
        assert_eq!(dap.args, vec!["--dap"]);
        assert_eq!(dap.shutdown_grace, Duration::from_secs(2));

        let repl = config.repl_config().unwrap();
        assert_eq!(repl.args, vec!["--repl"]);
        assert_eq!(repl.startup_timeout, Duration::from_secs(10));
        assert_eq!(repl.syntax.prompt(), DEFAULT_PROMPT);
        assert_eq!(repl.block_start.as_deref(), Some("بداية"));
    }

    #[test]
    fn load_from_applies_sections() {
        let (_dir, path) = write_config(
            r#"
[tool]
command = "/opt/tarqeem/bin/tarqeem"
working_dir = "/ws"

[lsp]
request_timeout_ms = 5000

[debugger]
args = ["dap", "--stdio"]

[repl]
eval_timeout_ms = 60000
banner = ""
block_start = ""
error_markers = ["Fehler"]
"#,
        );
        let config = QalamConfig::load_from(&path).unwrap().unwrap();

        assert_eq!(config.working_dir().unwrap(), PathBuf::from("/ws"));
        assert_eq!(config.lsp_config().command, "/opt/tarqeem/bin/tarqeem");
        assert_eq!(config.lsp_config().request_timeout, Duration::from_secs(5));
        assert_eq!(config.lsp_config().shutdown_grace, Duration::from_secs(2));
        assert_eq!(config.debugger_config().args, vec!["dap", "--stdio"]);

        let repl = config.repl_config().unwrap();
        assert_eq!(repl.eval_timeout, Duration::from_secs(60));
        assert!(repl.block_start.is_none());
        assert_eq!(repl.block_end.as_deref(), Some("نهاية"));
        assert!(!repl.syntax.classify("Fehler: x").success);
        assert!(repl.syntax.classify("خطأ: x").success);
    }

    #[test]
    fn load_from_expands_env_vars() {
        unsafe {
            std::env::set_var("QALAM_TEST_TOOL_DIR", "/tools");
        }
        let (_dir, path) = write_config(
            r#"
[tool]
command = "${QALAM_TEST_TOOL_DIR}/tarqeem"

[lsp]
args = ["--lsp", "--log=${QALAM_TEST_TOOL_DIR}/lsp.log"]
"#,
        );
        let config = QalamConfig::load_from(&path).unwrap().unwrap();
        unsafe {
            std::env::remove_var("QALAM_TEST_TOOL_DIR");
        }

        assert_eq!(config.tool.command, "/tools/tarqeem");
        assert_eq!(config.lsp.args[1], "--log=/tools/lsp.log");
    }

    #[test]
    fn load_from_invalid_toml_is_parse_error() {
        let (_dir, path) = write_config("[repl\neval_timeout_ms = ");
        let err = QalamConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), &path);
    }

    #[test]
    fn load_from_wrong_type_is_parse_error() {
        let (_dir, path) = write_config("[lsp]\nrequest_timeout_ms = \"soon\"\n");
        assert!(matches!(
            QalamConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn config_path_is_under_home() {
        if let Some(path) = config_path() {
            assert!(path.ends_with(".qalam/config.toml"));
        }
    }
}
