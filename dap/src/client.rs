//! Step-debugger client over the adapter's stdio.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use qalam_rpc::{
    Correlator, EventBus, LengthPrefixedDecoder, ProcessEvent, ProcessEvents, ProcessSpec,
    ProcessSupervisor, RpcError, SessionCell, SessionState, StopReason, Subscription,
    encode_frame,
};

use crate::protocol::{self, Incoming, Request, Response};
use crate::types::{
    Breakpoint, Capabilities, DapEvent, DapEventKind, DebuggerConfig, EvaluateResult,
    LaunchRequest, OutputEvent, Scope, SourceBreakpoint, StackFrame, StoppedEvent, Thread,
    Variable,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Session {
    process: ProcessSupervisor,
    correlator: Correlator<Value>,
    decoder: Mutex<LengthPrefixedDecoder>,
    capabilities: Mutex<Option<Capabilities>>,
    state: SessionCell,
    events: EventBus<DapEvent>,
    torn_down: AtomicBool,
}

impl Session {
    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn capabilities(&self) -> Capabilities {
        lock(&self.capabilities).clone().unwrap_or_default()
    }

    async fn call(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if self.is_torn_down() {
            return Err(RpcError::NotRunning);
        }
        let pending = self.correlator.register(command, timeout);
        let seq = pending.id();
        if self.is_torn_down() {
            self.correlator.settle(seq, Err(RpcError::NotRunning));
            return pending.wait().await;
        }

        match encode_frame(&Request::new(seq, command, arguments)) {
            Ok(bytes) => {
                tracing::debug!(seq, "-> {command}");
                self.process.write(bytes).await;
            }
            Err(e) => {
                self.correlator.settle(
                    seq,
                    Err(RpcError::Encode {
                        method: command.to_string(),
                        message: e.to_string(),
                    }),
                );
            }
        }
        pending.wait().await
    }

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
        tracing::info!(rejected, "debug session ended: {reason}");
        self.events.publish(&DapEvent::SessionEnded { reason });
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
                    tracing::error!("debug adapter stream unusable: {e}");
                    self.teardown(StopReason::Failed(e.to_string()));
                    self.process.terminate();
                    return;
                }
                Err(e) => tracing::warn!("skipping malformed frame from debug adapter: {e}"),
            }
        }
    }

    async fn dispatch(&self, frame: Value) {
        match protocol::parse_incoming(frame) {
            Some(Incoming::Response { request_seq, body }) => {
                self.correlator.settle_with(request_seq, |command| {
                    protocol::response_result(command, body)
                });
            }
            Some(Incoming::Event { event, body }) => {
                tracing::trace!("<- event {event}");
                self.events.publish(&DapEvent::from_wire(&event, body));
            }
            Some(Incoming::Request { seq, command }) => {
                tracing::debug!("declining reverse request '{command}'");
                let reply = Response::unsupported(self.correlator.reserve_id(), seq, &command);
                match encode_frame(&reply) {
                    Ok(bytes) => {
                        self.process.write(bytes).await;
                    }
                    Err(e) => tracing::warn!("failed to encode reply to {command}: {e}"),
                }
            }
            None => tracing::trace!("ignoring frame without a known type"),
        }
    }
}

async fn pump(session: Weak<Session>, mut events: ProcessEvents) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        match event {
            ProcessEvent::Stdout(chunk) => session.handle_stdout(&chunk).await,
            ProcessEvent::Stderr(chunk) => {
                tracing::debug!(
                    "debug adapter stderr: {}",
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

fn decode_field<T: DeserializeOwned>(
    command: &str,
    mut body: Value,
    key: &str,
) -> Result<T, RpcError> {
    let value = body.get_mut(key).map(Value::take).unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| RpcError::Decode {
        method: command.to_string(),
        message: format!("{key}: {e}"),
    })
}

struct Slot {
    state: SessionCell,
    session: Option<Arc<Session>>,
}

/// What `restart` needs to rebuild a session when the adapter cannot.
#[derive(Default)]
struct LastRun {
    working_dir: Option<PathBuf>,
    launch: Option<LaunchRequest>,
}

/// Client for the tool's debug-adapter mode.
pub struct DapClient {
    config: DebuggerConfig,
    events: EventBus<DapEvent>,
    slot: Mutex<Slot>,
    last_run: Mutex<LastRun>,
}

impl DapClient {
    #[must_use]
    pub fn new(config: DebuggerConfig) -> Self {
        Self {
            config,
            events: EventBus::new(),
            slot: Mutex::new(Slot {
                state: SessionCell::new(),
                session: None,
            }),
            last_run: Mutex::new(LastRun::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    /// Spawn the adapter in `working_dir` and run `initialize`.
    pub async fn start(&self, working_dir: &Path) -> Result<Capabilities, RpcError> {
        let state = self.begin()?;
        lock(&self.last_run).working_dir = Some(working_dir.to_path_buf());

        let spec = ProcessSpec::new(&self.config.command)
            .args(&self.config.args)
            .working_dir(working_dir);
        tracing::info!("Starting debug adapter ({})...", self.config.command);
        match ProcessSupervisor::spawn(&spec) {
            Ok((process, events)) => self.handshake(state, process, events).await,
            Err(e) => {
                tracing::warn!("Failed to start debug adapter: {e}");
                state.transition(SessionState::Stopped);
                self.events.publish(&DapEvent::SessionEnded {
                    reason: StopReason::Failed(e.to_string()),
                });
                Err(e.into())
            }
        }
    }

    /// Like [`start`](Self::start), over an already running process.
    pub async fn start_with_process(
        &self,
        working_dir: &Path,
        process: ProcessSupervisor,
        events: ProcessEvents,
    ) -> Result<Capabilities, RpcError> {
        let state = self.begin()?;
        lock(&self.last_run).working_dir = Some(working_dir.to_path_buf());
        self.handshake(state, process, events).await
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

    async fn handshake(
        &self,
        state: SessionCell,
        process: ProcessSupervisor,
        events: ProcessEvents,
    ) -> Result<Capabilities, RpcError> {
        let session = Arc::new(Session {
            process,
            correlator: Correlator::new(),
            decoder: Mutex::new(LengthPrefixedDecoder::new()),
            capabilities: Mutex::new(None),
            state: state.clone(),
            events: self.events.clone(),
            torn_down: AtomicBool::new(false),
        });
        lock(&self.slot).session = Some(Arc::clone(&session));
        tokio::spawn(pump(Arc::downgrade(&session), events));

        let arguments = protocol::initialize_arguments(&self.config.adapter_id);
        let capabilities = match session
            .call("initialize", Some(arguments), self.config.request_timeout)
            .await
        {
            // A missing body means no optional capabilities.
            Ok(Value::Null) => Ok(Capabilities::default()),
            Ok(body) => serde_json::from_value::<Capabilities>(body).map_err(|e| {
                RpcError::Decode {
                    method: "initialize".to_string(),
                    message: e.to_string(),
                }
            }),
            Err(e) => Err(e),
        };
        let capabilities = match capabilities {
            Ok(capabilities) => capabilities,
            Err(e) => {
                tracing::warn!("debug adapter initialize failed: {e}");
                session.teardown(StopReason::Failed(format!("initialize: {e}")));
                session.process.terminate();
                return Err(RpcError::Handshake(e.to_string()));
            }
        };
        *lock(&session.capabilities) = Some(capabilities.clone());

        if !state.transition(SessionState::Ready) {
            return Err(RpcError::Handshake(
                "adapter stopped during initialization".to_string(),
            ));
        }
        tracing::info!("Debug adapter ready");
        Ok(capabilities)
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

    /// Capabilities negotiated for the current session.
    #[must_use]
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.ready_session()
            .ok()
            .and_then(|s| lock(&s.capabilities).clone())
    }

    /// Send any request and wait for its body.
    pub async fn request(&self, command: &str, arguments: Option<Value>) -> Result<Value, RpcError> {
        self.ready_session()?
            .call(command, arguments, self.config.request_timeout)
            .await
    }

    /// Launch the debuggee.
    ///
    /// `configurationDone` goes out first, and only when the adapter declared
    /// support for it; after `launch` it would be a protocol violation.
    pub async fn launch(&self, launch: LaunchRequest) -> Result<(), RpcError> {
        let session = self.ready_session()?;
        lock(&self.last_run).launch = Some(launch.clone());

        if session.capabilities().supports_configuration_done_request {
            session
                .call("configurationDone", None, self.config.request_timeout)
                .await?;
        }
        session
            .call(
                "launch",
                Some(launch.to_arguments()),
                self.config.request_timeout,
            )
            .await?;
        Ok(())
    }

    /// Replace every breakpoint in `source` with `breakpoints`.
    pub async fn set_breakpoints(
        &self,
        source: &Path,
        breakpoints: &[SourceBreakpoint],
    ) -> Result<Vec<Breakpoint>, RpcError> {
        let arguments = json!({
            "source": {
                "path": source.display().to_string(),
                "name": source.file_name().map(|n| n.to_string_lossy().into_owned()),
            },
            "breakpoints": breakpoints,
        });
        let body = self.request("setBreakpoints", Some(arguments)).await?;
        decode_field("setBreakpoints", body, "breakpoints")
    }

    /// `continue`. Returns whether every thread was resumed.
    pub async fn continue_execution(&self, thread_id: i64) -> Result<bool, RpcError> {
        let body = self
            .request("continue", Some(json!({"threadId": thread_id})))
            .await?;
        Ok(body
            .get("allThreadsContinued")
            .and_then(Value::as_bool)
            .unwrap_or(true))
    }

    pub async fn step_over(&self, thread_id: i64) -> Result<(), RpcError> {
        self.request("next", Some(json!({"threadId": thread_id})))
            .await
            .map(drop)
    }

    pub async fn step_in(&self, thread_id: i64) -> Result<(), RpcError> {
        self.request("stepIn", Some(json!({"threadId": thread_id})))
            .await
            .map(drop)
    }

    pub async fn step_out(&self, thread_id: i64) -> Result<(), RpcError> {
        self.request("stepOut", Some(json!({"threadId": thread_id})))
            .await
            .map(drop)
    }

    pub async fn pause(&self, thread_id: i64) -> Result<(), RpcError> {
        self.request("pause", Some(json!({"threadId": thread_id})))
            .await
            .map(drop)
    }

    pub async fn threads(&self) -> Result<Vec<Thread>, RpcError> {
        let body = self.request("threads", None).await?;
        decode_field("threads", body, "threads")
    }

    pub async fn stack_trace(&self, thread_id: i64) -> Result<Vec<StackFrame>, RpcError> {
        let body = self
            .request("stackTrace", Some(json!({"threadId": thread_id})))
            .await?;
        decode_field("stackTrace", body, "stackFrames")
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>, RpcError> {
        let body = self
            .request("scopes", Some(json!({"frameId": frame_id})))
            .await?;
        decode_field("scopes", body, "scopes")
    }

    pub async fn variables(&self, variables_reference: i64) -> Result<Vec<Variable>, RpcError> {
        let body = self
            .request(
                "variables",
                Some(json!({"variablesReference": variables_reference})),
            )
            .await?;
        decode_field("variables", body, "variables")
    }

    /// Evaluate `expression`, in `frame_id` when given.
    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> Result<EvaluateResult, RpcError> {
        let mut arguments = json!({"expression": expression, "context": "repl"});
        if let Some(frame_id) = frame_id {
            arguments["frameId"] = json!(frame_id);
        }
        let body = self.request("evaluate", Some(arguments)).await?;
        serde_json::from_value(body).map_err(|e| RpcError::Decode {
            method: "evaluate".to_string(),
            message: e.to_string(),
        })
    }

    /// Restart the debuggee.
    ///
    /// Uses the adapter's `restart` when declared; otherwise stops this
    /// session, starts a new one in the same directory, and relaunches the
    /// last launch request.
    pub async fn restart(&self) -> Result<(), RpcError> {
        let session = self.ready_session()?;
        let (working_dir, launch) = {
            let last = lock(&self.last_run);
            (last.working_dir.clone(), last.launch.clone())
        };

        if session.capabilities().supports_restart_request {
            let arguments = launch.as_ref().map(|l| json!({"arguments": l.to_arguments()}));
            return self.request("restart", arguments).await.map(drop);
        }

        tracing::debug!("adapter has no restart request, relaunching");
        let working_dir = working_dir.ok_or(RpcError::NotRunning)?;
        self.stop().await;
        self.start(&working_dir).await?;
        if let Some(launch) = launch {
            self.launch(launch).await?;
        }
        Ok(())
    }

    /// `disconnect`, ignoring any failure, then teardown. The adapter is
    /// killed if it has not exited after the grace period.
    pub async fn stop(&self) {
        let Some(session) = self.session() else {
            return;
        };
        if session.is_torn_down() {
            return;
        }

        if session.state.get() == SessionState::Ready
            && let Err(e) = session
                .call(
                    "disconnect",
                    Some(json!({"terminateDebuggee": true})),
                    self.config.shutdown_grace,
                )
                .await
        {
            tracing::debug!("disconnect failed (ignored): {e}");
        }

        session.teardown(StopReason::Requested);
        session.process.shutdown(self.config.shutdown_grace).await;
    }

    pub fn on_stopped(
        &self,
        callback: impl Fn(&StoppedEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(DapEventKind::Stopped, move |event| {
            if let DapEvent::Stopped(stopped) = event {
                callback(stopped);
            }
        })
    }

    pub fn on_output(
        &self,
        callback: impl Fn(&OutputEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(DapEventKind::Output, move |event| {
            if let DapEvent::Output(output) = event {
                callback(output);
            }
        })
    }

    /// The debuggee terminated (`terminated` event).
    pub fn on_terminated(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.events
            .subscribe(DapEventKind::Terminated, move |_| callback())
    }

    pub fn on_event(&self, callback: impl Fn(&DapEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe_all(callback)
    }
}
