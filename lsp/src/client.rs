//! Language-intelligence client over the server's stdio.
//!
//! One client drives at most one server process at a time. `start()` spawns
//! the server and runs the `initialize` handshake; everything the server says
//! afterwards is read by a pump task that settles pending requests and
//! publishes notifications on the client's event bus.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use qalam_rpc::{
    Correlator, EventBus, LengthPrefixedDecoder, ProcessEvent, ProcessEvents, ProcessSpec,
    ProcessSupervisor, RpcError, SessionCell, SessionState, StopReason, Subscription,
    encode_frame,
};

use crate::diagnostics::{self, DiagnosticsStore};
use crate::protocol::{self, Incoming, Notification, Request};
use crate::types::{
    Diagnostic, DiagnosticsSnapshot, Location, LspEvent, LspEventKind, MessageLevel,
    ServerConfig,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything that lives exactly as long as one server process.
struct Session {
    process: ProcessSupervisor,
    correlator: Correlator<Value>,
    decoder: Mutex<LengthPrefixedDecoder>,
    capabilities: Mutex<Option<Value>>,
    diagnostics: Mutex<DiagnosticsStore>,
    /// Open documents and their last sent version.
    documents: Mutex<HashMap<PathBuf, i32>>,
    root: PathBuf,
    language_id: String,
    state: SessionCell,
    events: EventBus<LspEvent>,
    torn_down: AtomicBool,
}

impl Session {
    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    async fn send<T: Serialize>(&self, method: &str, message: &T) -> Result<(), RpcError> {
        let bytes = encode_frame(message).map_err(|e| RpcError::Encode {
            method: method.to_string(),
            message: e.to_string(),
        })?;
        self.process.write(bytes).await;
        Ok(())
    }

    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if self.is_torn_down() {
            return Err(RpcError::NotRunning);
        }
        let pending = self.correlator.register(method, timeout);
        let id = pending.id();
        // Teardown may have swept the table between the check and register.
        if self.is_torn_down() {
            self.correlator.settle(id, Err(RpcError::NotRunning));
            return pending.wait().await;
        }

        tracing::debug!(id, "-> {method}");
        if let Err(e) = self.send(method, &Request::new(id, method, params)).await {
            self.correlator.settle(id, Err(e));
        }
        pending.wait().await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        if self.is_torn_down() {
            return Err(RpcError::NotRunning);
        }
        tracing::debug!("-> {method} (notification)");
        self.send(method, &Notification::new(method, params)).await
    }

    /// Tear the session down. Only the first call has any effect.
    ///
    /// Runs synchronously: once this returns the state is `Stopped`, every
    /// pending request has been rejected, and session-scoped state is gone.
    fn teardown(&self, reason: StopReason) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.transition(SessionState::Stopped);
        let rejected = self
            .correlator
            .reject_all(&RpcError::stopped(reason.to_string()));
        lock(&self.decoder).clear();
        lock(&self.capabilities).take();
        lock(&self.documents).clear();
        lock(&self.diagnostics).clear();
        tracing::info!(rejected, "language server session ended: {reason}");
        self.events.publish(&LspEvent::Stopped { reason });
        true
    }

    async fn handle_stdout(&self, chunk: &[u8]) {
        let frames = {
            let mut decoder = lock(&self.decoder);
            if self.is_torn_down() {
                return;
            }
            decoder.decode(chunk)
        };

        for frame in frames {
            match frame {
                Ok(frame) => self.dispatch(frame).await,
                Err(e) if e.is_fatal() => {
                    tracing::error!("language server stream unusable: {e}");
                    self.teardown(StopReason::Failed(e.to_string()));
                    self.process.terminate();
                    return;
                }
                Err(e) => tracing::warn!("skipping malformed frame from language server: {e}"),
            }
        }
    }

    async fn dispatch(&self, frame: Value) {
        match protocol::parse_incoming(frame) {
            Some(Incoming::Response { id, body }) => {
                self.correlator
                    .settle_with(id, |method| protocol::response_result(method, body));
            }
            Some(Incoming::ServerRequest { id, method }) => {
                tracing::debug!("Rejecting server request '{method}' with MethodNotFound");
                let reply = protocol::method_not_found(id, &method);
                let _ = self.send(&method, &reply).await;
            }
            Some(Incoming::Notification { method, params }) => {
                self.handle_notification(&method, params);
            }
            None => tracing::trace!("ignoring frame with no method and no result"),
        }
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            "textDocument/publishDiagnostics" => {
                let Some(params) = params else { return };
                match serde_json::from_value::<protocol::PublishDiagnosticsParams>(params) {
                    Ok(params) => self.publish_diagnostics(&params),
                    Err(e) => tracing::debug!("Failed to parse publishDiagnostics: {e}"),
                }
            }
            "window/logMessage" | "window/showMessage" => {
                let parsed = params
                    .map(serde_json::from_value::<protocol::MessageParams>)
                    .transpose();
                match parsed {
                    Ok(Some(p)) => {
                        let level = MessageLevel::from_lsp(p.level);
                        let event = if method == "window/logMessage" {
                            LspEvent::LogMessage {
                                level,
                                message: p.message,
                            }
                        } else {
                            LspEvent::ShowMessage {
                                level,
                                message: p.message,
                            }
                        };
                        self.events.publish(&event);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::debug!("Failed to parse {method}: {e}"),
                }
            }
            _ => {
                tracing::trace!("forwarding notification {method}");
                self.events.publish(&LspEvent::Notification {
                    method: method.to_string(),
                    params,
                });
            }
        }
    }

    fn publish_diagnostics(&self, params: &protocol::PublishDiagnosticsParams) {
        let Some(path) = protocol::file_uri_to_path(&params.uri) else {
            tracing::debug!("ignoring diagnostics for non-file URI {}", params.uri);
            return;
        };
        if !diagnostics::is_within(&self.root, &path) {
            tracing::warn!(
                "language server reported diagnostics for path outside workspace: {}",
                path.display()
            );
            return;
        }

        let items: Vec<Diagnostic> = params
            .diagnostics
            .iter()
            .map(protocol::LspDiagnostic::to_diagnostic)
            .collect();
        if !lock(&self.diagnostics).replace(path.clone(), items.clone()) {
            tracing::trace!("diagnostics unchanged for {}", path.display());
        }
        self.events.publish(&LspEvent::Diagnostics { path, items });
    }
}

/// Reads process output until the process goes away.
///
/// Holds the session weakly so that dropping the client kills the server.
async fn pump(session: Weak<Session>, mut events: ProcessEvents) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        match event {
            ProcessEvent::Stdout(chunk) => session.handle_stdout(&chunk).await,
            ProcessEvent::Stderr(chunk) => {
                tracing::debug!(
                    "language server stderr: {}",
                    String::from_utf8_lossy(&chunk).trim_end()
                );
            }
            ProcessEvent::Exited(code) => {
                session.teardown(StopReason::Exited(code));
                return;
            }
        }
    }
    if let Some(session) = session.upgrade() {
        session.teardown(StopReason::Failed("output stream closed".to_string()));
    }
}

struct Slot {
    state: SessionCell,
    session: Option<Arc<Session>>,
}

/// Client for the tool's language-server mode.
pub struct LspClient {
    config: ServerConfig,
    events: EventBus<LspEvent>,
    slot: Mutex<Slot>,
}

impl LspClient {
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            events: EventBus::new(),
            slot: Mutex::new(Slot {
                state: SessionCell::new(),
                session: None,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Spawn the server for `workspace_root` and complete the handshake.
    ///
    /// Returns the server's declared capabilities.
    pub async fn start(&self, workspace_root: &Path) -> Result<Value, RpcError> {
        let state = self.begin()?;
        let spec = ProcessSpec::new(&self.config.command)
            .args(&self.config.args)
            .working_dir(workspace_root);

        tracing::info!("Starting language server ({})...", self.config.command);
        match ProcessSupervisor::spawn(&spec) {
            Ok((process, events)) => self.handshake(state, process, events, workspace_root).await,
            Err(e) => {
                tracing::warn!("Failed to start language server: {e}");
                self.abort_start(&state, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Like [`start`](Self::start), over an already running process.
    pub async fn start_with_process(
        &self,
        workspace_root: &Path,
        process: ProcessSupervisor,
        events: ProcessEvents,
    ) -> Result<Value, RpcError> {
        let state = self.begin()?;
        self.handshake(state, process, events, workspace_root).await
    }

    fn begin(&self) -> Result<SessionCell, RpcError> {
        let mut slot = lock(&self.slot);
        if matches!(
            slot.state.get(),
            SessionState::Starting | SessionState::Ready
        ) {
            return Err(RpcError::AlreadyStarted);
        }
        let state = SessionCell::new();
        state.transition(SessionState::Starting);
        slot.state = state.clone();
        slot.session = None;
        Ok(state)
    }

    fn abort_start(&self, state: &SessionCell, message: String) {
        state.transition(SessionState::Stopped);
        self.events.publish(&LspEvent::Stopped {
            reason: StopReason::Failed(message),
        });
    }

    async fn handshake(
        &self,
        state: SessionCell,
        process: ProcessSupervisor,
        events: ProcessEvents,
        workspace_root: &Path,
    ) -> Result<Value, RpcError> {
        let root = diagnostics::normalize_path(workspace_root);
        let root_uri = match protocol::path_to_file_uri(&root) {
            Ok(uri) => uri,
            Err(e) => {
                process.terminate();
                self.abort_start(&state, e.to_string());
                return Err(RpcError::Handshake(e.to_string()));
            }
        };

        let session = Arc::new(Session {
            process,
            correlator: Correlator::new(),
            decoder: Mutex::new(LengthPrefixedDecoder::new()),
            capabilities: Mutex::new(None),
            diagnostics: Mutex::new(DiagnosticsStore::default()),
            documents: Mutex::new(HashMap::new()),
            root,
            language_id: self.config.language_id.clone(),
            state: state.clone(),
            events: self.events.clone(),
            torn_down: AtomicBool::new(false),
        });
        lock(&self.slot).session = Some(Arc::clone(&session));
        tokio::spawn(pump(Arc::downgrade(&session), events));

        let params = protocol::initialize_params(root_uri.as_str());
        let result = match session
            .call("initialize", Some(params), self.config.request_timeout)
            .await
        {
            Ok(result) => result,
            Err(e) => return Err(Self::fail_handshake(&session, &e)),
        };
        let capabilities = result
            .get("capabilities")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        *lock(&session.capabilities) = Some(capabilities.clone());

        if let Err(e) = session
            .notify("initialized", Some(serde_json::json!({})))
            .await
        {
            return Err(Self::fail_handshake(&session, &e));
        }

        if !state.transition(SessionState::Ready) {
            return Err(RpcError::Handshake(
                "server stopped during initialization".to_string(),
            ));
        }
        tracing::info!("Language server ready");
        Ok(capabilities)
    }

    fn fail_handshake(session: &Session, error: &RpcError) -> RpcError {
        tracing::warn!("language server initialize failed: {error}");
        session.teardown(StopReason::Failed(format!("initialize: {error}")));
        session.process.terminate();
        RpcError::Handshake(error.to_string())
    }

    fn session(&self) -> Option<Arc<Session>> {
        lock(&self.slot).session.clone()
    }

    fn ready_session(&self) -> Result<Arc<Session>, RpcError> {
        let slot = lock(&self.slot);
        match &slot.session {
            Some(session) if slot.state.get() == SessionState::Ready => Ok(Arc::clone(session)),
            _ => Err(RpcError::NotRunning),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        lock(&self.slot).state.get()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Capabilities declared by the server; `None` outside a ready session.
    #[must_use]
    pub fn capabilities(&self) -> Option<Value> {
        self.ready_session()
            .ok()
            .and_then(|s| lock(&s.capabilities).clone())
    }

    /// Whether the server declared `provider` (e.g. `"hoverProvider"`).
    #[must_use]
    pub fn supports(&self, provider: &str) -> bool {
        self.capabilities()
            .and_then(|caps| caps.get(provider).cloned())
            .is_some_and(|v| !matches!(v, Value::Null | Value::Bool(false)))
    }

    /// Send a request and wait for its result.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let session = self.ready_session()?;
        session
            .call(method, params, self.config.request_timeout)
            .await
    }

    /// Send a notification. No response is ever expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.ready_session()?.notify(method, params).await
    }

    /// Push the full text of `path`: `didOpen` the first time, a versioned
    /// `didChange` afterwards.
    pub async fn did_change(&self, path: &Path, text: &str) -> Result<(), RpcError> {
        let session = self.ready_session()?;
        let uri = document_uri("textDocument/didChange", path)?;

        let (method, params) = {
            let mut documents = lock(&session.documents);
            match documents.get_mut(path) {
                Some(version) => {
                    *version += 1;
                    (
                        "textDocument/didChange",
                        protocol::did_change_params(uri.as_str(), *version, text),
                    )
                }
                None => {
                    documents.insert(path.to_path_buf(), 1);
                    (
                        "textDocument/didOpen",
                        protocol::did_open_params(uri.as_str(), &session.language_id, 1, text),
                    )
                }
            }
        };
        session.notify(method, Some(params)).await
    }

    /// Close `path` if it is open.
    pub async fn did_close(&self, path: &Path) -> Result<(), RpcError> {
        let session = self.ready_session()?;
        if lock(&session.documents).remove(path).is_none() {
            return Ok(());
        }
        let uri = document_uri("textDocument/didClose", path)?;
        session
            .notify(
                "textDocument/didClose",
                Some(protocol::did_close_params(uri.as_str())),
            )
            .await
    }

    /// Hover text at a 0-indexed position, flattened to plain text.
    pub async fn hover(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Option<String>, RpcError> {
        let uri = document_uri("textDocument/hover", path)?;
        let result = self
            .request(
                "textDocument/hover",
                Some(protocol::text_document_position_params(
                    uri.as_str(),
                    line,
                    character,
                )),
            )
            .await?;
        Ok(protocol::hover_text(&result))
    }

    /// Definition site(s) of the symbol at a 0-indexed position.
    pub async fn definition(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Vec<Location>, RpcError> {
        let uri = document_uri("textDocument/definition", path)?;
        let result = self
            .request(
                "textDocument/definition",
                Some(protocol::text_document_position_params(
                    uri.as_str(),
                    line,
                    character,
                )),
            )
            .await?;
        Ok(protocol::parse_locations(&result))
    }

    #[must_use]
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.session()
            .map(|s| lock(&s.diagnostics).snapshot())
            .unwrap_or_default()
    }

    /// `shutdown`, then `exit` whatever the outcome, then teardown. The
    /// process is killed if it has not exited after the grace period.
    pub async fn stop(&self) {
        let Some(session) = self.session() else {
            return;
        };
        if session.is_torn_down() {
            return;
        }

        if session.state.get() == SessionState::Ready
            && let Err(e) = session
                .call("shutdown", None, self.config.shutdown_grace)
                .await
        {
            tracing::debug!("language server shutdown request failed: {e}");
        }
        let _ = session.notify("exit", None).await;

        session.teardown(StopReason::Requested);
        session.process.shutdown(self.config.shutdown_grace).await;
    }

    pub fn on_diagnostics(
        &self,
        callback: impl Fn(&Path, &[Diagnostic]) + Send + Sync + 'static,
    ) -> Subscription {
        self.events
            .subscribe(LspEventKind::Diagnostics, move |event| {
                if let LspEvent::Diagnostics { path, items } = event {
                    callback(path, items);
                }
            })
    }

    /// `window/logMessage` and `window/showMessage`.
    pub fn on_log(
        &self,
        callback: impl Fn(MessageLevel, &str) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe_all(move |event| match event {
            LspEvent::LogMessage { level, message } | LspEvent::ShowMessage { level, message } => {
                callback(*level, message);
            }
            _ => {}
        })
    }

    pub fn on_stopped(
        &self,
        callback: impl Fn(&StopReason) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(LspEventKind::Stopped, move |event| {
            if let LspEvent::Stopped { reason } = event {
                callback(reason);
            }
        })
    }

    /// Every event, for logging or forwarding.
    pub fn on_event(&self, callback: impl Fn(&LspEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe_all(callback)
    }
}

fn document_uri(method: &str, path: &Path) -> Result<url::Url, RpcError> {
    protocol::path_to_file_uri(path).map_err(|e| RpcError::Encode {
        method: method.to_string(),
        message: e.to_string(),
    })
}
