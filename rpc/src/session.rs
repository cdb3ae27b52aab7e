//! Session lifecycle shared by every protocol façade.

use std::sync::Arc;

use tokio::sync::watch;

/// Lifecycle of one client session.
///
/// ```text
/// NotStarted ──> Starting ──> Ready ──> Stopped
///                    └──────────────────────^
/// ```
///
/// `Stopped` is terminal; a restart builds a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    NotStarted,
    Starting,
    Ready,
    Stopped,
}

impl SessionState {
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Starting)
                | (Self::Starting, Self::Ready | Self::Stopped)
                | (Self::Ready, Self::Stopped)
        )
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called.
    Requested,
    /// The process exited on its own.
    Exited(Option<i32>),
    /// Spawn, handshake, or stream failure.
    Failed(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => f.write_str("stopped by client"),
            Self::Exited(Some(code)) => write!(f, "process exited with code {code}"),
            Self::Exited(None) => f.write_str("process was killed"),
            Self::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

/// Observable, transition-checked session state.
#[derive(Debug, Clone)]
pub struct SessionCell {
    tx: Arc<watch::Sender<SessionState>>,
}

impl Default for SessionCell {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCell {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::NotStarted);
        Self { tx: Arc::new(tx) }
    }

    #[must_use]
    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.get() == SessionState::Ready
    }

    /// Move to `next` if the transition is legal. Returns whether it moved.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut from = SessionState::NotStarted;
        let moved = self.tx.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(from = from.label(), to = next.label(), "session transition");
        } else if from != next {
            tracing::trace!(
                from = from.label(),
                to = next.label(),
                "ignoring illegal session transition"
            );
        }
        moved
    }

    /// Wait until the state satisfies `pred`, returning the state seen.
    pub async fn wait_for(&self, pred: impl Fn(SessionState) -> bool) -> SessionState {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|state| pred(*state)).await {
            Ok(state) => *state,
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => self.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(
            StopReason::Exited(Some(2)).to_string(),
            "process exited with code 2"
        );
        assert_eq!(StopReason::Exited(None).to_string(), "process was killed");
        assert_eq!(
            StopReason::Failed("bad frame".into()).to_string(),
            "failed: bad frame"
        );
    }

    #[test]
    fn test_legal_path_to_ready_and_stopped() {
        let cell = SessionCell::new();
        assert_eq!(cell.get(), SessionState::NotStarted);
        assert!(cell.transition(SessionState::Starting));
        assert!(!cell.is_running());
        assert!(cell.transition(SessionState::Ready));
        assert!(cell.is_running());
        assert!(cell.transition(SessionState::Stopped));
        assert!(!cell.is_running());
    }

    #[test]
    fn test_nothing_leaves_stopped() {
        let cell = SessionCell::new();
        cell.transition(SessionState::Starting);
        cell.transition(SessionState::Stopped);
        for next in [
            SessionState::NotStarted,
            SessionState::Starting,
            SessionState::Ready,
        ] {
            assert!(!cell.transition(next));
        }
        assert_eq!(cell.get(), SessionState::Stopped);
    }

    #[test]
    fn test_cannot_skip_starting() {
        let cell = SessionCell::new();
        assert!(!cell.transition(SessionState::Ready));
        assert!(!cell.transition(SessionState::Stopped));
        assert_eq!(cell.get(), SessionState::NotStarted);
    }

    #[test]
    fn test_repeated_stop_is_not_a_transition() {
        let cell = SessionCell::new();
        cell.transition(SessionState::Starting);
        assert!(cell.transition(SessionState::Stopped));
        assert!(!cell.transition(SessionState::Stopped));
    }

    #[tokio::test]
    async fn test_wait_for_observes_later_transition() {
        let cell = SessionCell::new();
        cell.transition(SessionState::Starting);
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_for(|s| s != SessionState::Starting).await })
        };
        tokio::task::yield_now().await;
        cell.transition(SessionState::Ready);
        assert_eq!(waiter.await.unwrap(), SessionState::Ready);
    }
}
