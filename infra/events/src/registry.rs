use crate::error::BusError;
use crate::event::{Event, short_type_name};
use async_trait::async_trait;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::any::TypeId;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

const REMOVAL_BUFFER: usize = 64;

/// Handles one event type.
///
/// Returning an error sends the message through the retry tiers and, once they
/// are exhausted, to the dead-letter queue.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, event: E) -> anyhow::Result<()>;
}

pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Decodes a body and starts the handler on it.
pub(crate) type Invoker = Arc<dyn Fn(&[u8]) -> Result<HandlerFuture, BusError> + Send + Sync>;

/// One handler bound to one queue for an event.
#[derive(Clone)]
pub struct Subscription {
    pub handler: String,
    pub queue: String,
    pub routing_key: String,
    pub(crate) invoker: Invoker,
}

impl Subscription {
    pub(crate) fn new<E, H>(handler: Arc<H>, queue: String, routing_key: String) -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        let invoker: Invoker = Arc::new(move |body: &[u8]| {
            let event: E =
                serde_json::from_slice(body).map_err(|e| BusError::Deserialization {
                    message: e.to_string().into(),
                    context: Some(E::NAME.into()),
                })?;
            let handler = Arc::clone(&handler);
            Ok(Box::pin(async move { handler.handle(event).await }) as HandlerFuture)
        });
        Self { handler: short_type_name::<H>().to_owned(), queue, routing_key, invoker }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handler", &self.handler)
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .finish_non_exhaustive()
    }
}

/// The Rust type registered under an event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventType {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl EventType {
    #[must_use]
    pub fn of<E: Event>() -> Self {
        Self { type_id: TypeId::of::<E>(), type_name: std::any::type_name::<E>() }
    }
}

#[derive(Debug, Default)]
struct Entries {
    subscriptions: FxHashMap<String, Vec<Subscription>>,
    types: FxHashMap<String, EventType>,
}

/// Event name to subscriptions, behind a single lock.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    entries: Mutex<Entries>,
    removed: broadcast::Sender<String>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        let (removed, _) = broadcast::channel(REMOVAL_BUFFER);
        Self { entries: Mutex::new(Entries::default()), removed }
    }
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `subscription` under `event`.
    ///
    /// # Errors
    /// [`BusError::DuplicateSubscription`] if the same handler is already bound to the same queue.
    pub fn add_subscription(
        &self,
        event: &str,
        event_type: EventType,
        subscription: Subscription,
    ) -> Result<(), BusError> {
        let mut entries = self.entries.lock();
        let list = entries.subscriptions.entry(event.to_owned()).or_default();
        if list.iter().any(|s| s.handler == subscription.handler && s.queue == subscription.queue) {
            return Err(BusError::DuplicateSubscription {
                message: format!(
                    "handler '{}' is already subscribed to '{event}' on '{}'",
                    subscription.handler, subscription.queue
                )
                .into(),
                context: None,
            });
        }
        debug!(event, handler = %subscription.handler, queue = %subscription.queue, "Subscription added");
        list.push(subscription);
        entries.types.entry(event.to_owned()).or_insert(event_type);
        Ok(())
    }

    /// Removes the first subscription of `handler` (on `queue`, when given).
    ///
    /// Removing the last subscription of an event forgets the event and sends one
    /// notice to [`Self::removals`] listeners. Returns the removed subscription.
    pub fn remove_subscription(
        &self,
        event: &str,
        handler: &str,
        queue: Option<&str>,
    ) -> Option<Subscription> {
        let mut entries = self.entries.lock();
        let list = entries.subscriptions.get_mut(event)?;
        let position = list
            .iter()
            .position(|s| s.handler == handler && queue.is_none_or(|q| s.queue == q))?;
        let removed = list.remove(position);

        if list.is_empty() {
            entries.subscriptions.remove(event);
            entries.types.remove(event);
            drop(entries);
            info!(event, "Last subscription removed");
            let _ = self.removed.send(event.to_owned());
        }
        Some(removed)
    }

    /// Names of events whose last subscription was removed.
    #[must_use]
    pub fn removals(&self) -> broadcast::Receiver<String> {
        self.removed.subscribe()
    }

    #[must_use]
    pub fn has_subscriptions_for_event(&self, event: &str) -> bool {
        self.entries.lock().subscriptions.get(event).is_some_and(|list| !list.is_empty())
    }

    /// `None` when the event was never subscribed.
    #[must_use]
    pub fn handlers_for_event(&self, event: &str) -> Option<Vec<Subscription>> {
        self.entries.lock().subscriptions.get(event).cloned()
    }

    #[must_use]
    pub fn event_type_by_name(&self, event: &str) -> Option<EventType> {
        self.entries.lock().types.get(event).copied()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.subscriptions.clear();
        entries.types.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMeta;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, crate::Event)]
    struct Ping {
        #[serde(flatten)]
        meta: EventMeta,
    }

    struct PingHandler;

    #[async_trait]
    impl EventHandler<Ping> for PingHandler {
        async fn handle(&self, _event: Ping) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn subscription(queue: &str) -> Subscription {
        Subscription::new::<Ping, _>(Arc::new(PingHandler), queue.to_owned(), String::new())
    }

    #[test]
    fn handler_identity_is_the_short_type_name() {
        assert_eq!(subscription("q").handler, "PingHandler");
    }

    #[test]
    fn same_handler_on_same_queue_is_rejected() {
        let registry = SubscriptionRegistry::new();
        registry.add_subscription("Ping", EventType::of::<Ping>(), subscription("q1")).unwrap();
        registry.add_subscription("Ping", EventType::of::<Ping>(), subscription("q2")).unwrap();

        let err = registry
            .add_subscription("Ping", EventType::of::<Ping>(), subscription("q1"))
            .unwrap_err();
        assert!(err.is_duplicate_subscription());
        assert_eq!(registry.handlers_for_event("Ping").map(|l| l.len()), Some(2));
    }

    #[test]
    fn last_removal_notifies_once() {
        let registry = SubscriptionRegistry::new();
        let mut removals = registry.removals();
        registry.add_subscription("Ping", EventType::of::<Ping>(), subscription("q1")).unwrap();
        registry.add_subscription("Ping", EventType::of::<Ping>(), subscription("q2")).unwrap();

        assert!(registry.remove_subscription("Ping", "PingHandler", None).is_some());
        assert!(removals.try_recv().is_err());
        assert!(registry.has_subscriptions_for_event("Ping"));

        let last = registry.remove_subscription("Ping", "PingHandler", None).unwrap();
        assert_eq!(last.queue, "q2");
        assert_eq!(removals.try_recv().unwrap(), "Ping");
        assert!(removals.try_recv().is_err());
        assert!(!registry.has_subscriptions_for_event("Ping"));
        assert!(registry.event_type_by_name("Ping").is_none());
        assert!(registry.remove_subscription("Ping", "PingHandler", None).is_none());
    }

    #[test]
    fn event_type_lookup() {
        let registry = SubscriptionRegistry::new();
        registry.add_subscription("Ping", EventType::of::<Ping>(), subscription("q")).unwrap();
        assert_eq!(registry.event_type_by_name("Ping"), Some(EventType::of::<Ping>()));

        registry.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn invoker_decodes_and_runs_handler() {
        let sub = subscription("q");
        let body = serde_json::to_vec(&Ping { meta: EventMeta::new() }).unwrap();
        let future = (sub.invoker)(&body).unwrap();
        assert!(future.await.is_ok());

        let err = (sub.invoker)(b"not json").err().unwrap();
        assert!(matches!(err, BusError::Deserialization { .. }));
    }
}
