use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use iap_schemas::StoreEvent;
use tokio::sync::mpsc;
use tracing::warn;

type Handler = Arc<dyn Fn(&StoreEvent) -> anyhow::Result<()> + Send + Sync>;

/// Opaque handle returned by [`EventBus::subscribe`]; pass it back to
/// [`EventBus::unsubscribe`] to stop delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

#[derive(Default)]
struct Registry {
    next_token: u64,
    handlers: Vec<(SubscriptionToken, Handler)>,
}

/// Multi-producer notification channel with synchronous fan-out.
///
/// - `publish()` calls every current handler exactly once, in subscription
///   order, before returning.
/// - A handler returning `Err` or panicking is logged and skipped; siblings
///   and the publisher are unaffected.
/// - Handlers may subscribe or unsubscribe from inside a callback: delivery
///   works on a snapshot of the registry taken at publish time.
///
/// Handlers must not call back into the component that is publishing unless
/// that component publishes outside its own critical section (the trackers do).
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for all future events.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&StoreEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut reg = self.lock();
        let token = SubscriptionToken(reg.next_token);
        reg.next_token += 1;
        reg.handlers.push((token, Arc::new(handler)));
        token
    }

    /// Subscribe through an unbounded channel, for async consumers.
    ///
    /// Once the receiver is dropped the handler starts failing; failures are
    /// logged until the token is unsubscribed.
    pub fn subscribe_channel(&self) -> (SubscriptionToken, mpsc::UnboundedReceiver<StoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.subscribe(move |ev| {
            tx.send(ev.clone())
                .map_err(|_| anyhow::anyhow!("channel subscriber receiver dropped"))
        });
        (token, rx)
    }

    /// Remove a handler. Returns `false` if the token was unknown (already
    /// removed or never issued by this bus).
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut reg = self.lock();
        let before = reg.handlers.len();
        reg.handlers.retain(|(t, _)| *t != token);
        reg.handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().handlers.len()
    }

    /// Deliver an event to every current subscriber.
    ///
    /// Accepts anything that converts into [`StoreEvent`], so publishers can
    /// pass a `PurchaseNotification` or `CatalogEvent` directly.
    pub fn publish<E: Into<StoreEvent>>(&self, event: E) {
        let event = event.into();
        // Snapshot so no lock is held while user code runs.
        let handlers: Vec<(SubscriptionToken, Handler)> = self.lock().handlers.clone();

        for (token, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(subscriber = token.0, error = %err, "event subscriber failed");
                }
                Err(_) => {
                    warn!(subscriber = token.0, "event subscriber panicked");
                }
            }
        }
    }
}
