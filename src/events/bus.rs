//! Synchronous, in-order publish/subscribe bus

use super::{LifecycleEvent, Topic};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Handler invoked for each event on a subscribed topic
pub type EventHandler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Default)]
struct Subscribers {
    by_topic: HashMap<Topic, Vec<(SubscriptionId, EventHandler)>>,
}

/// Cloneable handle to a shared subscriber table
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every event published on `topic`
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers
            .by_topic
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(topic = %topic, subscription = %id, "Subscribed to topic");
        id
    }

    /// Remove a subscription. Returns false when it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for handlers in subscribers.by_topic.values_mut() {
            let before = handlers.len();
            handlers.retain(|(existing, _)| *existing != id);
            removed |= handlers.len() != before;
        }
        removed
    }

    /// Deliver `event` to every handler of its topic before returning.
    ///
    /// Handlers run outside the table lock, so a handler may publish or
    /// subscribe itself. Returns the number of handlers invoked.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        let topic = event.topic();
        let handlers: Vec<EventHandler> = {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers
                .by_topic
                .get(&topic)
                .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };

        for handler in &handlers {
            handler(&event);
        }

        debug!(topic = %topic, delivered = handlers.len(), "Published event");
        handlers.len()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_topic
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Drop every subscription
    pub fn clear(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .by_topic
            .clear();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<Topic, usize> = Topic::ALL
            .iter()
            .map(|topic| (*topic, self.subscriber_count(*topic)))
            .collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}
