//! Typed event bus for unsolicited protocol messages.
//!
//! Each façade defines a closed event enum and a matching `Kind`
//! discriminant. Subscribers register for one kind or for everything;
//! [`EventBus::publish`] invokes them synchronously, in subscription order.

use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// An event that can travel over an [`EventBus`].
pub trait BusEvent: Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E: BusEvent> {
    id: u64,
    /// `None` receives every event.
    filter: Option<E::Kind>,
    callback: Callback<E>,
}

struct Registry<E: BusEvent> {
    next_id: u64,
    subscribers: Vec<Subscriber<E>>,
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
}

impl<E: BusEvent> Detach for Mutex<Registry<E>> {
    fn detach(&self, id: u64) -> bool {
        let mut registry = self.lock().unwrap_or_else(PoisonError::into_inner);
        let before = registry.subscribers.len();
        registry.subscribers.retain(|s| s.id != id);
        registry.subscribers.len() != before
    }
}

/// Handle returned by every subscribe call.
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to end it.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Subscription {
    registry: Weak<dyn Detach>,
    id: u64,
}

impl Subscription {
    /// Remove the subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.detach(self.id))
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

pub struct EventBus<E: BusEvent> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: BusEvent> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> EventBus<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 1,
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, filter: Option<E::Kind>, callback: Callback<E>) -> Subscription {
        let id = {
            let mut registry = self.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.subscribers.push(Subscriber {
                id,
                filter,
                callback,
            });
            id
        };
        let registry: Arc<dyn Detach> = self.registry.clone();
        Subscription {
            registry: Arc::downgrade(&registry),
            id,
        }
    }

    /// Receive events of one kind.
    pub fn subscribe(
        &self,
        kind: E::Kind,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        self.add(Some(kind), Arc::new(callback))
    }

    /// Receive every event, whatever its kind.
    pub fn subscribe_all(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        self.add(None, Arc::new(callback))
    }

    /// Deliver `event` to every matching subscriber.
    ///
    /// A panicking subscriber is logged and skipped; later subscribers still
    /// run. Returns the number of subscribers that completed normally.
    pub fn publish(&self, event: &E) -> usize {
        let kind = event.kind();
        let targets: Vec<Callback<E>> = self
            .lock()
            .subscribers
            .iter()
            .filter(|s| s.filter.is_none_or(|k| k == kind))
            .map(|s| Arc::clone(&s.callback))
            .collect();

        let mut delivered = 0;
        for callback in targets {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_ok() {
                delivered += 1;
            } else {
                tracing::warn!(?kind, "event subscriber panicked");
            }
        }
        delivered
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}
