//! Request correlation: pairs asynchronously arriving responses with the
//! callers waiting on them.
//!
//! Every registration gets a fresh identifier and its own deadline timer.
//! An entry leaves the table exactly once: by [`Correlator::settle`], by its
//! timer firing, or by [`Correlator::reject_all`]. Removal is the guard, so
//! whichever of the three comes first wins and the others become no-ops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::RpcError;

pub type RequestId = u64;

type Settlement<T> = Result<T, RpcError>;

struct Pending<T> {
    method: String,
    created_at: Instant,
    tx: oneshot::Sender<Settlement<T>>,
    timer: Option<AbortHandle>,
}

impl<T> Pending<T> {
    fn resolve(self, result: Settlement<T>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have stopped waiting; nothing left to deliver to.
        let _ = self.tx.send(result);
    }
}

struct Table<T> {
    next_id: RequestId,
    entries: HashMap<RequestId, Pending<T>>,
}

/// Table of in-flight requests for one session.
///
/// Cloning shares the table.
pub struct Correlator<T> {
    table: Arc<Mutex<Table<T>>>,
}

impl<T> Clone for Correlator<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<T: Send + 'static> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Correlator<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                next_id: 1,
                entries: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table<T>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an identifier and start its deadline.
    ///
    /// Identifiers increase monotonically and are never reused within the
    /// lifetime of this correlator. Must be called inside a tokio runtime.
    pub fn register(&self, method: impl Into<String>, timeout: Duration) -> PendingResponse<T> {
        let method = method.into();
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut table = self.lock();
            let id = table.next_id;
            table.next_id += 1;
            table.entries.insert(
                id,
                Pending {
                    method: method.clone(),
                    created_at: Instant::now(),
                    tx,
                    timer: None,
                },
            );
            id
        };

        let weak: Weak<Mutex<Table<T>>> = Arc::downgrade(&self.table);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = weak.upgrade() {
                Self { table }.expire(id);
            }
        });

        // The timer may already have fired; then the entry is gone.
        if let Some(entry) = self.lock().entries.get_mut(&id) {
            entry.timer = Some(timer.abort_handle());
        }

        PendingResponse { id, method, rx }
    }

    fn expire(&self, id: RequestId) {
        let Some(entry) = self.lock().entries.remove(&id) else {
            return;
        };
        tracing::debug!(id, method = %entry.method, "request timed out");
        let method = entry.method.clone();
        entry.resolve(Err(RpcError::Timeout { method }));
    }

    /// Settle `id` with `result`.
    ///
    /// Returns `false` (and does nothing else) when `id` is unknown, which
    /// covers late responses after a timeout and duplicate responses.
    pub fn settle(&self, id: RequestId, result: Settlement<T>) -> bool {
        self.settle_with(id, |_| result)
    }

    /// Settle `id` with a result built from the original method name.
    ///
    /// `build` only runs if `id` is still pending.
    pub fn settle_with(
        &self,
        id: RequestId,
        build: impl FnOnce(&str) -> Settlement<T>,
    ) -> bool {
        let Some(entry) = self.lock().entries.remove(&id) else {
            tracing::trace!(id, "ignoring response for unknown request id");
            return false;
        };
        tracing::trace!(
            id,
            method = %entry.method,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "request settled"
        );
        let result = build(&entry.method);
        entry.resolve(result);
        true
    }

    /// Fail every pending request with `error`. Returns how many were failed.
    pub fn reject_all(&self, error: &RpcError) -> usize {
        let drained: Vec<_> = self.lock().entries.drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            entry.resolve(Err(error.clone()));
        }
        if count > 0 {
            tracing::debug!(count, %error, "rejected pending requests");
        }
        count
    }

    /// Take the next identifier without registering anything under it.
    ///
    /// For outgoing messages that share the request sequence but expect no
    /// reply, such as answers to requests from the remote.
    pub fn reserve_id(&self) -> RequestId {
        let mut table = self.lock();
        let id = table.next_id;
        table.next_id += 1;
        id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: RequestId) -> bool {
        self.lock().entries.contains_key(&id)
    }
}

/// Caller's side of a registered request.
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse<T> {
    id: RequestId,
    method: String,
    rx: oneshot::Receiver<Settlement<T>>,
}

impl<T> PendingResponse<T> {
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the response, the deadline, or session teardown.
    pub async fn wait(self) -> Settlement<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::stopped(format!(
                "{} abandoned before settling",
                self.method
            ))),
        }
    }
}
