//! Typed lifecycle events and the publish/subscribe bus that carries them
//!
//! Subscribers register per [`Topic`]. Delivery is synchronous and in
//! registration order: when [`EventBus::publish`] returns, every handler for the
//! event's topic has run.

pub mod bus;

pub use bus::{EventBus, EventHandler, SubscriptionId};

use crate::health::monitor::HealthRecord;
use crate::health::process::ProcessHealth;
use crate::observability::metrics::MetricsSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event topics subscribers can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Raw events emitted for a provider
    Provider,
    /// Derived state transitions
    StateChange,
    /// Every provider health check outcome
    HealthUpdate,
    /// Resource or health readings over threshold
    HealthWarning,
    /// Sustained degradation
    HealthCritical,
    /// Periodic metrics publication
    MetricsUpdated,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Provider,
        Topic::StateChange,
        Topic::HealthUpdate,
        Topic::HealthWarning,
        Topic::HealthCritical,
        Topic::MetricsUpdated,
    ];

    /// Wire name of the topic
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Provider => "provider",
            Topic::StateChange => "stateChange",
            Topic::HealthUpdate => "healthUpdate",
            Topic::HealthWarning => "health:warning",
            Topic::HealthCritical => "health:critical",
            Topic::MetricsUpdated => "metrics:updated",
        }
    }

    pub fn parse(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|topic| topic.as_str() == name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a provider.
///
/// States are opaque labels; any state may follow any other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProviderState {
    Connecting,
    Connected,
    Disconnected,
    Error,
    Other(String),
}

impl ProviderState {
    pub fn as_str(&self) -> &str {
        match self {
            ProviderState::Connecting => "connecting",
            ProviderState::Connected => "connected",
            ProviderState::Disconnected => "disconnected",
            ProviderState::Error => "error",
            ProviderState::Other(label) => label,
        }
    }
}

impl From<&str> for ProviderState {
    fn from(label: &str) -> Self {
        match label {
            "connecting" => ProviderState::Connecting,
            "connected" => ProviderState::Connected,
            "disconnected" => ProviderState::Disconnected,
            "error" => ProviderState::Error,
            other => ProviderState::Other(other.to_string()),
        }
    }
}

impl From<String> for ProviderState {
    fn from(label: String) -> Self {
        ProviderState::from(label.as_str())
    }
}

impl From<ProviderState> for String {
    fn from(state: ProviderState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw event emitted on behalf of a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub name: String,
    pub new_state: Option<ProviderState>,
    pub reason: Option<String>,
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProviderEvent {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            new_state: None,
            reason: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    /// Event that moves the provider into `state`
    pub fn state_change(state: ProviderState) -> Self {
        let mut event = Self::new(state.as_str().to_string());
        event.new_state = Some(state);
        event
    }

    pub fn with_reason<S: Into<String>>(mut self, reason: S) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_state_change(&self) -> bool {
        self.new_state.is_some()
    }
}

/// One recorded change of a provider's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub provider_id: String,
    pub old_state: Option<ProviderState>,
    pub new_state: ProviderState,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Subject of a warning or critical health event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum HealthAlert {
    Provider(HealthRecord),
    Process(ProcessHealth),
}

/// Every event carried by the bus
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", content = "payload")]
pub enum LifecycleEvent {
    #[serde(rename = "provider")]
    Provider {
        provider_id: String,
        event: ProviderEvent,
    },
    #[serde(rename = "stateChange")]
    StateChange(StateTransition),
    #[serde(rename = "healthUpdate")]
    HealthUpdate(HealthRecord),
    #[serde(rename = "health:warning")]
    HealthWarning(HealthAlert),
    #[serde(rename = "health:critical")]
    HealthCritical(HealthAlert),
    #[serde(rename = "metrics:updated")]
    MetricsUpdated(MetricsSnapshot),
}

impl LifecycleEvent {
    pub fn topic(&self) -> Topic {
        match self {
            LifecycleEvent::Provider { .. } => Topic::Provider,
            LifecycleEvent::StateChange(_) => Topic::StateChange,
            LifecycleEvent::HealthUpdate(_) => Topic::HealthUpdate,
            LifecycleEvent::HealthWarning(_) => Topic::HealthWarning,
            LifecycleEvent::HealthCritical(_) => Topic::HealthCritical,
            LifecycleEvent::MetricsUpdated(_) => Topic::MetricsUpdated,
        }
    }

    /// Provider the event concerns, when it concerns one
    pub fn provider_id(&self) -> Option<&str> {
        match self {
            LifecycleEvent::Provider { provider_id, .. } => Some(provider_id),
            LifecycleEvent::StateChange(transition) => Some(&transition.provider_id),
            LifecycleEvent::HealthUpdate(record) => Some(&record.provider_id),
            LifecycleEvent::HealthWarning(HealthAlert::Provider(record))
            | LifecycleEvent::HealthCritical(HealthAlert::Provider(record)) => {
                Some(&record.provider_id)
            }
            LifecycleEvent::MetricsUpdated(snapshot) => Some(&snapshot.provider_id),
            LifecycleEvent::HealthWarning(HealthAlert::Process(_))
            | LifecycleEvent::HealthCritical(HealthAlert::Process(_)) => None,
        }
    }
}

/// Anything that accepts raw provider events.
///
/// Implemented by [`crate::state::StateManager`]; the pool and the lifecycle
/// root publish through this seam.
pub trait EventSink: Send + Sync {
    fn emit_event(&self, provider_id: &str, event: ProviderEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::StateChange.as_str(), "stateChange");
        assert_eq!(Topic::HealthCritical.as_str(), "health:critical");
        assert_eq!(Topic::parse("metrics:updated"), Some(Topic::MetricsUpdated));
        assert_eq!(Topic::parse("unknown"), None);
    }

    #[test]
    fn test_provider_state_labels() {
        assert_eq!(ProviderState::from("connected"), ProviderState::Connected);
        assert_eq!(
            ProviderState::from("warming-up"),
            ProviderState::Other("warming-up".to_string())
        );
        assert_eq!(ProviderState::Other("x".to_string()).to_string(), "x");

        let json = serde_json::to_string(&ProviderState::Disconnected).unwrap();
        assert_eq!(json, "\"disconnected\"");
    }

    #[test]
    fn test_state_change_event_builder() {
        let event = ProviderEvent::state_change(ProviderState::Error).with_reason("refused");
        assert!(event.is_state_change());
        assert_eq!(event.name, "error");
        assert_eq!(event.reason.as_deref(), Some("refused"));

        let plain = ProviderEvent::new("request");
        assert!(!plain.is_state_change());
    }

    #[test]
    fn test_event_topic_and_provider() {
        let event = LifecycleEvent::Provider {
            provider_id: "p1".to_string(),
            event: ProviderEvent::new("request"),
        };
        assert_eq!(event.topic(), Topic::Provider);
        assert_eq!(event.provider_id(), Some("p1"));
    }
}
