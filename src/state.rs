//! Current state and bounded transition history per provider
//!
//! The state manager records; it does not validate. Any state may follow any
//! other, and enforcing legal sequences is the emitter's job.

use crate::events::{
    EventBus, EventSink, LifecycleEvent, ProviderEvent, ProviderState, StateTransition,
    SubscriptionId, Topic,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Default number of transitions kept per provider
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Default)]
struct StateRecord {
    current: Option<ProviderState>,
    history: VecDeque<StateTransition>,
    /// Recorded events not yet published, in record order
    outbox: VecDeque<LifecycleEvent>,
    dispatching: bool,
}

/// Single source of truth for each provider's lifecycle state
#[derive(Debug)]
pub struct StateManager {
    bus: EventBus,
    records: Mutex<HashMap<String, StateRecord>>,
    history_limit: usize,
}

impl StateManager {
    pub fn new(bus: EventBus) -> Self {
        Self::with_history_limit(bus, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(bus: EventBus, history_limit: usize) -> Self {
        Self {
            bus,
            records: Mutex::new(HashMap::new()),
            history_limit: history_limit.max(1),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<String, StateRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the raw event, then record and publish the derived transition
    /// when the event carries a new state.
    ///
    /// A provider's events are published in the order they were recorded.
    /// Only one call publishes for a provider at a time: a call that finds
    /// another one publishing, on another thread or further up its own stack,
    /// queues its events for that call to deliver and returns.
    pub fn emit_event(&self, provider_id: &str, event: ProviderEvent) {
        if !self.record(provider_id, event) {
            return;
        }

        let _guard = DispatchGuard {
            manager: self,
            provider_id,
        };
        loop {
            let next = {
                let mut records = self.lock_records();
                let Some(record) = records.get_mut(provider_id) else {
                    return;
                };
                match record.outbox.pop_front() {
                    Some(event) => event,
                    None => {
                        record.dispatching = false;
                        return;
                    }
                }
            };
            self.bus.publish(next);
        }
    }

    /// Queue the event and its transition. Returns whether the caller should
    /// publish the queue.
    fn record(&self, provider_id: &str, event: ProviderEvent) -> bool {
        let mut records = self.lock_records();
        let record = records.entry(provider_id.to_string()).or_default();

        let transition = event.new_state.clone().map(|new_state| {
            let transition = StateTransition {
                provider_id: provider_id.to_string(),
                old_state: record.current.replace(new_state.clone()),
                new_state,
                reason: event.reason.clone(),
                timestamp: chrono::Utc::now(),
            };

            record.history.push_back(transition.clone());
            while record.history.len() > self.history_limit {
                record.history.pop_front();
            }
            transition
        });

        record.outbox.push_back(LifecycleEvent::Provider {
            provider_id: provider_id.to_string(),
            event,
        });
        if let Some(transition) = transition {
            debug!(
                provider_id = %provider_id,
                old_state = ?transition.old_state,
                new_state = %transition.new_state,
                "Provider state changed"
            );
            record.outbox.push_back(LifecycleEvent::StateChange(transition));
        }

        !std::mem::replace(&mut record.dispatching, true)
    }

    pub fn get_current_state(&self, provider_id: &str) -> Option<ProviderState> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .and_then(|record| record.current.clone())
    }

    /// Oldest-first copy of the provider's transitions
    pub fn get_state_history(&self, provider_id: &str) -> Vec<StateTransition> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .map(|record| record.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget the history; the current state is kept
    pub fn clear_history(&self, provider_id: &str) {
        if let Some(record) = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(provider_id)
        {
            record.history.clear();
        }
    }

    /// Providers that have a current state
    pub fn providers(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, record)| record.current.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }
}

/// Hands publishing back if a handler panics, so later events still go out
struct DispatchGuard<'a> {
    manager: &'a StateManager,
    provider_id: &'a str,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            if let Some(record) = self.manager.lock_records().get_mut(self.provider_id) {
                record.dispatching = false;
            }
        }
    }
}

impl EventSink for StateManager {
    fn emit_event(&self, provider_id: &str, event: ProviderEvent) {
        StateManager::emit_event(self, provider_id, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_state_change_updates_current_state() {
        let manager = StateManager::new(EventBus::new());
        assert_eq!(manager.get_current_state("p1"), None);

        manager.emit_event("p1", ProviderEvent::state_change(ProviderState::Connecting));
        manager.emit_event("p1", ProviderEvent::state_change(ProviderState::Connected));

        assert_eq!(
            manager.get_current_state("p1"),
            Some(ProviderState::Connected)
        );

        let history = manager.get_state_history("p1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old_state, None);
        assert_eq!(history[1].old_state, Some(ProviderState::Connecting));
        assert_eq!(history[1].new_state, ProviderState::Connected);
    }

    #[test]
    fn test_non_state_events_are_not_recorded() {
        let manager = StateManager::new(EventBus::new());
        manager.emit_event("p1", ProviderEvent::new("request"));

        assert_eq!(manager.get_current_state("p1"), None);
        assert!(manager.get_state_history("p1").is_empty());
    }

    #[test]
    fn test_raw_event_published_before_state_change() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for topic in [Topic::Provider, Topic::StateChange] {
            let order = order.clone();
            bus.subscribe(topic, move |event| order.lock().unwrap().push(event.topic()));
        }

        let manager = StateManager::new(bus);
        manager.emit_event("p1", ProviderEvent::state_change(ProviderState::Connected));

        assert_eq!(
            *order.lock().unwrap(),
            vec![Topic::Provider, Topic::StateChange]
        );
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let manager = StateManager::new(EventBus::new());
        for i in 0..101 {
            manager.emit_event(
                "p1",
                ProviderEvent::state_change(ProviderState::Other(format!("s{i}"))),
            );
        }

        let history = manager.get_state_history("p1");
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].new_state, ProviderState::Other("s1".to_string()));
        assert!(history
            .iter()
            .all(|t| t.new_state != ProviderState::Other("s0".to_string())));
    }

    #[test]
    fn test_history_snapshot_is_a_copy() {
        let manager = StateManager::new(EventBus::new());
        manager.emit_event("p1", ProviderEvent::state_change(ProviderState::Connected));

        let mut snapshot = manager.get_state_history("p1");
        snapshot.clear();

        assert_eq!(manager.get_state_history("p1").len(), 1);
    }

    #[test]
    fn test_clear_history_keeps_current_state() {
        let manager = StateManager::new(EventBus::new());
        manager.emit_event("p1", ProviderEvent::state_change(ProviderState::Error));
        manager.clear_history("p1");

        assert!(manager.get_state_history("p1").is_empty());
        assert_eq!(manager.get_current_state("p1"), Some(ProviderState::Error));
        assert_eq!(manager.providers(), vec!["p1".to_string()]);
    }

    #[test]
    fn test_providers_are_independent() {
        let manager = StateManager::new(EventBus::new());
        manager.emit_event("a", ProviderEvent::state_change(ProviderState::Connected));
        manager.emit_event("b", ProviderEvent::state_change(ProviderState::Error));

        assert_eq!(manager.get_current_state("a"), Some(ProviderState::Connected));
        assert_eq!(manager.get_state_history("b").len(), 1);
    }

    fn transitions_of(events: &[LifecycleEvent]) -> Vec<(Option<ProviderState>, ProviderState)> {
        events
            .iter()
            .filter_map(|event| match event {
                LifecycleEvent::StateChange(t) => Some((t.old_state.clone(), t.new_state.clone())),
                _ => None,
            })
            .collect()
    }

    fn history_of(manager: &StateManager) -> Vec<(Option<ProviderState>, ProviderState)> {
        manager
            .get_state_history("p1")
            .into_iter()
            .map(|t| (t.old_state, t.new_state))
            .collect()
    }

    #[test]
    fn test_handler_emits_are_published_after_the_current_event() {
        let bus = EventBus::new();
        let manager = Arc::new(StateManager::new(bus.clone()));

        // Subscribed before the recorder, so a nested publish would overtake it
        let weak = Arc::downgrade(&manager);
        bus.subscribe(Topic::StateChange, move |event| {
            if let LifecycleEvent::StateChange(t) = event {
                if t.new_state == ProviderState::Connected {
                    if let Some(manager) = weak.upgrade() {
                        manager.emit_event(
                            "p1",
                            ProviderEvent::state_change(ProviderState::Disconnected),
                        );
                    }
                }
            }
        });
        let published = Arc::new(Mutex::new(Vec::new()));
        {
            let published = published.clone();
            bus.subscribe(Topic::StateChange, move |event| {
                published.lock().unwrap().push(event.clone());
            });
        }

        manager.emit_event("p1", ProviderEvent::state_change(ProviderState::Connected));

        let published = transitions_of(&published.lock().unwrap());
        assert_eq!(
            published,
            vec![
                (None, ProviderState::Connected),
                (Some(ProviderState::Connected), ProviderState::Disconnected),
            ]
        );
        assert_eq!(published, history_of(&manager));
        assert_eq!(
            manager.get_current_state("p1"),
            Some(ProviderState::Disconnected)
        );
    }

    #[test]
    fn test_concurrent_emits_publish_in_record_order() {
        let bus = EventBus::new();
        let manager = Arc::new(StateManager::with_history_limit(bus.clone(), 1_000));
        let published = Arc::new(Mutex::new(Vec::new()));
        {
            let published = published.clone();
            bus.subscribe(Topic::StateChange, move |event| {
                published.lock().unwrap().push(event.clone());
            });
        }

        let threads: Vec<_> = (0..8)
            .map(|thread| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        manager.emit_event(
                            "p1",
                            ProviderEvent::state_change(ProviderState::Other(format!(
                                "t{thread}-{i}"
                            ))),
                        );
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let published = transitions_of(&published.lock().unwrap());
        assert_eq!(published.len(), 400);
        assert_eq!(published, history_of(&manager));
        assert_eq!(
            manager.get_current_state("p1"),
            published.last().map(|(_, new_state)| new_state.clone())
        );
    }

    #[test]
    fn test_panicking_handler_does_not_stall_later_events() {
        let bus = EventBus::new();
        let manager = StateManager::new(bus.clone());
        let id = bus.subscribe(Topic::StateChange, |_| panic!("handler failed"));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            manager.emit_event("p1", ProviderEvent::state_change(ProviderState::Connected));
        }));
        assert!(result.is_err());
        bus.unsubscribe(id);

        let published = Arc::new(Mutex::new(Vec::new()));
        {
            let published = published.clone();
            bus.subscribe(Topic::StateChange, move |event| {
                published.lock().unwrap().push(event.clone());
            });
        }
        manager.emit_event("p1", ProviderEvent::state_change(ProviderState::Error));

        assert_eq!(
            transitions_of(&published.lock().unwrap()),
            vec![(Some(ProviderState::Connected), ProviderState::Error)]
        );
    }

    proptest! {
        #[test]
        fn prop_history_keeps_latest_transitions(transitions in 1usize..250, limit in 1usize..50) {
            let manager = StateManager::with_history_limit(EventBus::new(), limit);
            for i in 0..transitions {
                manager.emit_event(
                    "p1",
                    ProviderEvent::state_change(ProviderState::Other(format!("s{i}"))),
                );
            }

            let history = manager.get_state_history("p1");
            prop_assert_eq!(history.len(), transitions.min(limit));
            let first = transitions - history.len();
            for (offset, transition) in history.iter().enumerate() {
                prop_assert_eq!(
                    &transition.new_state,
                    &ProviderState::Other(format!("s{}", first + offset))
                );
            }
        }
    }
}
