//! One client per protocol, created on first use.

use std::sync::OnceLock;

use anyhow::Result;

use qalam_config::QalamConfig;
use qalam_dap::DapClient;
use qalam_lsp::LspClient;
use qalam_repl::ReplClient;

pub(crate) struct ClientRegistry {
    config: QalamConfig,
    lsp: OnceLock<LspClient>,
    dap: OnceLock<DapClient>,
    repl: OnceLock<ReplClient>,
}

impl ClientRegistry {
    pub(crate) fn new(config: QalamConfig) -> Self {
        Self {
            config,
            lsp: OnceLock::new(),
            dap: OnceLock::new(),
            repl: OnceLock::new(),
        }
    }

    pub(crate) fn lsp(&self) -> &LspClient {
        self.lsp
            .get_or_init(|| LspClient::new(self.config.lsp_config()))
    }

    pub(crate) fn dap(&self) -> &DapClient {
        self.dap
            .get_or_init(|| DapClient::new(self.config.debugger_config()))
    }

    pub(crate) fn repl(&self) -> Result<&ReplClient> {
        if let Some(client) = self.repl.get() {
            return Ok(client);
        }
        let config = self.config.repl_config()?;
        Ok(self.repl.get_or_init(|| ReplClient::new(config)))
    }

    /// Stop every client that was created. Safe to call more than once.
    pub(crate) async fn dispose(&self) {
        if let Some(client) = self.lsp.get() {
            client.stop().await;
        }
        if let Some(client) = self.dap.get() {
            client.stop().await;
        }
        if let Some(client) = self.repl.get() {
            client.stop().await;
        }
        tracing::debug!("Client registry disposed");
    }
}
