//! Read-eval-print client over the evaluator's stdio.
//!
//! The evaluator's wire protocol has no request identifiers: a snippet goes
//! in, output comes back, and the prompt reappears. Responses can only be
//! paired with requests by position, so a session allows a single
//! outstanding evaluation. A second concurrent `evaluate` fails with
//! [`RpcError::Busy`] instead of queueing.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::oneshot;

use qalam_rpc::{
    Correlator, EvalOutcome, EventBus, ProcessEvent, ProcessEvents, ProcessSpec,
    ProcessSupervisor, PromptDecoder, RequestId, RpcError, SessionCell, SessionState, StopReason,
    Subscription,
};

use crate::types::{ReplConfig, ReplEvent, ReplEventKind};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Session {
    process: ProcessSupervisor,
    correlator: Correlator<EvalOutcome>,
    decoder: Mutex<PromptDecoder>,
    /// Set while an evaluation is outstanding.
    evaluating: AtomicBool,
    /// Correlator entry of the outstanding evaluation.
    current: Mutex<Option<RequestId>>,
    /// Resolved by the pump on the first prompt.
    ready_tx: Mutex<Option<oneshot::Sender<()>>>,
    state: SessionCell,
    events: EventBus<ReplEvent>,
    torn_down: AtomicBool,
}

impl Session {
    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
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
        lock(&self.current).take();
        // Dropping the sender wakes a pending start with an error.
        lock(&self.ready_tx).take();
        tracing::info!(rejected, "evaluator session ended: {reason}");
        self.events.publish(&ReplEvent::Stopped { reason });
        true
    }

    fn handle_stdout(&self, chunk: &[u8]) {
        let turn = {
            let mut decoder = lock(&self.decoder);
            if self.is_torn_down() {
                return;
            }
            decoder.push(chunk)
        };
        if let Some(text) = turn {
            self.complete_turn(&text);
        }
    }

    /// Error-stream bytes join the current turn while an evaluation is
    /// outstanding; otherwise they are published on their own.
    fn handle_stderr(&self, chunk: &[u8]) {
        if self.evaluating.load(Ordering::SeqCst) {
            let turn = {
                let mut decoder = lock(&self.decoder);
                if self.is_torn_down() {
                    return;
                }
                decoder.push(chunk)
            };
            if let Some(text) = turn {
                self.complete_turn(&text);
            }
            return;
        }

        let text = String::from_utf8_lossy(chunk).trim_end().to_string();
        if !text.is_empty() {
            tracing::debug!("evaluator stderr while idle: {text}");
            self.events.publish(&ReplEvent::Stderr(text));
        }
    }

    fn complete_turn(&self, text: &str) {
        if let Some(ready) = lock(&self.ready_tx).take() {
            tracing::debug!("evaluator prompt observed");
            let _ = ready.send(());
            let greeting = lock(&self.decoder)
                .syntax()
                .strip_banner(text)
                .trim()
                .to_string();
            if !greeting.is_empty() {
                self.events.publish(&ReplEvent::Output(greeting));
            }
            return;
        }

        let outcome = lock(&self.decoder).syntax().classify(text);

        let current = lock(&self.current).take();
        match current {
            Some(id) => {
                self.correlator.settle(id, Ok(outcome));
            }
            None => {
                let text = text.trim();
                if !text.is_empty() {
                    tracing::trace!("unsolicited evaluator output");
                    self.events.publish(&ReplEvent::Output(text.to_string()));
                }
            }
        }
    }
}

/// Clears the single-evaluation slot however `evaluate` exits.
struct Evaluating<'a>(&'a Session);

impl Drop for Evaluating<'_> {
    fn drop(&mut self) {
        lock(&self.0.current).take();
        self.0.evaluating.store(false, Ordering::SeqCst);
    }
}

async fn pump(session: Weak<Session>, mut events: ProcessEvents) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        match event {
            ProcessEvent::Stdout(chunk) => session.handle_stdout(&chunk),
            ProcessEvent::Stderr(chunk) => session.handle_stderr(&chunk),
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

/// Wrap `code` in the block sentinels unless it already carries them.
fn wrap_snippet(code: &str, block_start: Option<&str>, block_end: Option<&str>) -> String {
    let code = code.trim_end();
    match (block_start, block_end) {
        (Some(start), Some(end)) if !(code.contains(start) && code.contains(end)) => {
            format!("{start}\n{code}\n{end}\n")
        }
        _ => format!("{code}\n"),
    }
}

struct Slot {
    state: SessionCell,
    session: Option<Arc<Session>>,
}

/// Client for the tool's interactive evaluator.
pub struct ReplClient {
    config: ReplConfig,
    events: EventBus<ReplEvent>,
    slot: Mutex<Slot>,
}

impl ReplClient {
    #[must_use]
    pub fn new(config: ReplConfig) -> Self {
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
    pub fn config(&self) -> &ReplConfig {
        &self.config
    }

    /// Spawn the evaluator in `working_dir` and wait for its first prompt.
    pub async fn start(&self, working_dir: &Path) -> Result<(), RpcError> {
        let state = self.begin()?;
        let spec = ProcessSpec::new(&self.config.command)
            .args(&self.config.args)
            .working_dir(working_dir);

        tracing::info!("Starting evaluator ({})...", self.config.command);
        match ProcessSupervisor::spawn(&spec) {
            Ok((process, events)) => self.await_prompt(state, process, events).await,
            Err(e) => {
                tracing::warn!("Failed to start evaluator: {e}");
                state.transition(SessionState::Stopped);
                self.events.publish(&ReplEvent::Stopped {
                    reason: StopReason::Failed(e.to_string()),
                });
                Err(e.into())
            }
        }
    }

    /// Like [`start`](Self::start), over an already running process.
    pub async fn start_with_process(
        &self,
        process: ProcessSupervisor,
        events: ProcessEvents,
    ) -> Result<(), RpcError> {
        let state = self.begin()?;
        self.await_prompt(state, process, events).await
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

    /// Readiness is inferred from output shape: the session is ready the
    /// first time the prompt appears.
    async fn await_prompt(
        &self,
        state: SessionCell,
        process: ProcessSupervisor,
        events: ProcessEvents,
    ) -> Result<(), RpcError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let session = Arc::new(Session {
            process,
            correlator: Correlator::new(),
            decoder: Mutex::new(PromptDecoder::new(self.config.syntax.clone())),
            evaluating: AtomicBool::new(false),
            current: Mutex::new(None),
            ready_tx: Mutex::new(Some(ready_tx)),
            state: state.clone(),
            events: self.events.clone(),
            torn_down: AtomicBool::new(false),
        });
        lock(&self.slot).session = Some(Arc::clone(&session));
        tokio::spawn(pump(Arc::downgrade(&session), events));

        match tokio::time::timeout(self.config.startup_timeout, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(RpcError::Handshake(
                    "evaluator stopped before showing a prompt".to_string(),
                ));
            }
            Err(_) => {
                tracing::warn!(
                    "evaluator showed no prompt within {:?}",
                    self.config.startup_timeout
                );
                session.teardown(StopReason::Failed("no prompt before startup deadline".to_string()));
                session.process.terminate();
                return Err(RpcError::Timeout {
                    method: "startup".to_string(),
                });
            }
        }

        if !state.transition(SessionState::Ready) {
            return Err(RpcError::Handshake(
                "evaluator stopped during startup".to_string(),
            ));
        }
        tracing::info!("Evaluator ready");
        Ok(())
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

    /// Whether an evaluation is outstanding.
    #[must_use]
    pub fn is_evaluating(&self) -> bool {
        self.session()
            .is_some_and(|s| s.evaluating.load(Ordering::SeqCst))
    }

    /// Evaluate `code` and classify what the evaluator printed.
    ///
    /// Fails with [`RpcError::Busy`] if another evaluation is outstanding.
    /// After a timeout, whatever the evaluator prints for the abandoned
    /// snippet is discarded or, once its prompt arrives, published as
    /// unsolicited output.
    pub async fn evaluate(&self, code: &str) -> Result<EvalOutcome, RpcError> {
        let session = self.ready_session()?;
        if session
            .evaluating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RpcError::Busy);
        }
        let _slot = Evaluating(&session);

        let pending = session
            .correlator
            .register("evaluate", self.config.eval_timeout);
        *lock(&session.current) = Some(pending.id());
        if session.is_torn_down() {
            session.correlator.settle(pending.id(), Err(RpcError::NotRunning));
            return pending.wait().await;
        }

        let payload = wrap_snippet(
            code,
            self.config.block_start.as_deref(),
            self.config.block_end.as_deref(),
        );
        tracing::debug!(bytes = payload.len(), "-> evaluate");
        session.process.write(payload.into_bytes()).await;

        let result = pending.wait().await;
        if let Err(e) = &result
            && e.is_timeout()
        {
            tracing::warn!("evaluation timed out after {:?}", self.config.eval_timeout);
            lock(&session.decoder).clear();
        }
        result
    }

    /// Send the exit command, tear down, and kill the evaluator if it is
    /// still running after the grace period.
    pub async fn stop(&self) {
        let Some(session) = self.session() else {
            return;
        };
        if session.is_torn_down() {
            return;
        }

        if session.state.get() == SessionState::Ready {
            let line = format!("{}\n", self.config.exit_command);
            session.process.write(line.into_bytes()).await;
        }
        session.teardown(StopReason::Requested);
        session.process.shutdown(self.config.shutdown_grace).await;
    }

    /// Turns that completed with no evaluation outstanding.
    pub fn on_output(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(ReplEventKind::Output, move |event| {
            if let ReplEvent::Output(text) = event {
                callback(text);
            }
        })
    }

    /// Error-stream text received while idle.
    pub fn on_stderr(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(ReplEventKind::Stderr, move |event| {
            if let ReplEvent::Stderr(text) = event {
                callback(text);
            }
        })
    }

    pub fn on_stopped(
        &self,
        callback: impl Fn(&StopReason) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(ReplEventKind::Stopped, move |event| {
            if let ReplEvent::Stopped { reason } = event {
                callback(reason);
            }
        })
    }

    pub fn on_event(&self, callback: impl Fn(&ReplEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe_all(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_snippet_adds_sentinels() {
        assert_eq!(
            wrap_snippet("اطبع ١\n", Some("بداية"), Some("نهاية")),
            "بداية\nاطبع ١\nنهاية\n"
        );
    }

    #[test]
    fn test_wrap_snippet_keeps_wrapped_code() {
        let code = "بداية\nاطبع ١\nنهاية";
        assert_eq!(
            wrap_snippet(code, Some("بداية"), Some("نهاية")),
            format!("{code}\n")
        );
    }

    #[test]
    fn test_wrap_snippet_without_sentinels() {
        assert_eq!(wrap_snippet("١ + ١", None, None), "١ + ١\n");
        assert_eq!(wrap_snippet("١ + ١", Some("بداية"), None), "١ + ١\n");
    }
}
