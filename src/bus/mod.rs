//! Event bus for intra-kernel pub/sub.
//!
//! All coordination inside the kernel flows over this bus as named events,
//! enabling:
//!   - Loose coupling between the cognitive pipeline and agents
//!   - Full tracing and observability of every emission
//!   - Fault isolation (a panicking handler cannot stop dispatch)
//!
//! Topics are `:`-separated strings (`agent:builder:response`) and
//! subscriptions use [`TopicPattern`]s where `*` matches exactly one
//! segment. Dispatch is synchronous fan-out in subscription order.

mod topic;

pub use topic::{Segment, TopicPattern, TOPIC_SEPARATOR, WILDCARD};

use crate::kernel::recovery::panic_message;
use crate::types::{Error, EventId, Result, SubscriptionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

// =============================================================================
// Event
// =============================================================================

/// A single event flowing over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Component that emitted the event, when known.
    pub source: Option<String>,
}

impl Event {
    /// Create a new event stamped with a fresh id and the current time.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: EventId::generate(),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// =============================================================================
// Canonical topics
// =============================================================================

/// Event types published by the kernel and the cognitive pipeline.
///
/// Topics with a fixed shape are constants; per-agent topics are built by
/// the helper functions so the `agent:<id>:...` layout lives in one place.
pub mod topics {
    use crate::types::AgentId;

    pub const AGENT_REGISTERED: &str = "agent:registered";
    pub const AGENT_UNREGISTERED: &str = "agent:unregistered";
    pub const AGENT_LIFECYCLE_ERROR: &str = "agent:lifecycle_error";

    pub const POLICY_DENIED: &str = "cognition:policy_denied";
    pub const APPROVAL_REQUIRED: &str = "cognition:approval_required";
    pub const AGENT_NOT_FOUND: &str = "cognition:agent_not_found";
    pub const LEARNED: &str = "cognition:learned";

    pub const AGENT_RECOVERED: &str = "health:agent_recovered";
    pub const RECOVERY_FAILED: &str = "health:recovery_failed";

    pub const KERNEL_STARTED: &str = "kernel:started";
    pub const KERNEL_STOPPED: &str = "kernel:stopped";

    /// Pattern covering every input source (`input:text`, `input:voice`, ...).
    pub const INPUT_PATTERN: &str = "input:*";

    /// Per-agent response topic (`agent:<id>:response`).
    pub fn agent_response(id: &AgentId) -> String {
        format!("agent:{}:response", id)
    }

    /// Per-agent error topic (`agent:<id>:error`).
    pub fn agent_error(id: &AgentId) -> String {
        format!("agent:{}:error", id)
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Boxed event callback.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Subscription receipt for managing subscriptions.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub pattern: String,
}

/// How a subscription consumes events.
enum Sink {
    /// Invoked inline during dispatch.
    Callback(EventHandler),
    /// Clones of matching events are pushed into a channel.
    Channel(mpsc::UnboundedSender<Event>),
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Callback(_) => f.write_str("Sink::Callback"),
            Sink::Channel(_) => f.write_str("Sink::Channel"),
        }
    }
}

#[derive(Debug)]
struct HandlerEntry {
    id: SubscriptionId,
    pattern: TopicPattern,
    sink: Sink,
}

// =============================================================================
// EventBus
// =============================================================================

/// In-memory pub/sub bus.
///
/// Handlers are stored in subscription order and dispatch walks that order
/// for every emission, so two handlers on the same pattern observe events
/// in the order they subscribed. A handler panic is caught, counted and
/// logged; remaining handlers still run.
#[derive(Debug)]
pub struct EventBus {
    /// All live subscriptions, in subscription order.
    handlers: Arc<RwLock<Vec<HandlerEntry>>>,

    /// Statistics
    stats: Arc<RwLock<BusStats>>,
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub events_emitted: u64,
    pub deliveries: u64,
    pub handler_panics: u64,
    pub active_subscriptions: usize,
}

impl EventBus {
    /// Create a new EventBus instance.
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(RwLock::new(BusStats::default())),
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Emit an event to every matching subscription.
    ///
    /// This is a fan-out operation: the event is delivered inline to ALL
    /// handlers whose pattern matches `event.event_type`, in subscription
    /// order. Returns the number of successful deliveries.
    pub async fn emit(&self, event: Event) -> Result<usize> {
        if event.event_type.is_empty() {
            return Err(Error::validation("event type cannot be empty"));
        }

        // Snapshot matching sinks so handlers may subscribe, unsubscribe or
        // emit again without deadlocking against this dispatch.
        let matching: Vec<(SubscriptionId, Sink)> = {
            let handlers = self.handlers.read().await;
            handlers
                .iter()
                .filter(|entry| entry.pattern.matches(&event.event_type))
                .map(|entry| {
                    let sink = match &entry.sink {
                        Sink::Callback(handler) => Sink::Callback(Arc::clone(handler)),
                        Sink::Channel(tx) => Sink::Channel(tx.clone()),
                    };
                    (entry.id.clone(), sink)
                })
                .collect()
        };

        let mut delivered = 0;
        let mut panics = 0u64;
        let mut closed: Vec<SubscriptionId> = Vec::new();

        for (id, sink) in &matching {
            match sink {
                Sink::Callback(handler) => {
                    match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                        Ok(()) => delivered += 1,
                        Err(payload) => {
                            panics += 1;
                            tracing::warn!(
                                "handler_panic_isolated: subscription={} event_type={} panic={}",
                                id,
                                event.event_type,
                                panic_message(payload.as_ref())
                            );
                        }
                    }
                }
                Sink::Channel(tx) => {
                    // A closed channel means the receiver was dropped; the
                    // subscription is pruned below so counts stay accurate.
                    if tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        closed.push(id.clone());
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut handlers = self.handlers.write().await;
            handlers.retain(|entry| !closed.contains(&entry.id));
            let mut stats = self.stats.write().await;
            stats.active_subscriptions = handlers.len();
        }

        // Update stats
        let mut stats = self.stats.write().await;
        stats.events_emitted += 1;
        stats.deliveries += delivered as u64;
        stats.handler_panics += panics;
        drop(stats);

        tracing::debug!(
            "Emitted event type={} to {} handlers",
            event.event_type,
            delivered
        );

        Ok(delivered)
    }

    /// Build an event from parts and emit it, logging instead of returning
    /// emission errors. Used for kernel-internal notifications where a bad
    /// emission must not unwind the operation that produced it.
    pub async fn publish(&self, event_type: &str, data: serde_json::Value) {
        if let Err(err) = self.emit(Event::new(event_type, data)).await {
            tracing::warn!("event_publish_failed: type={} error={}", event_type, err);
        }
    }

    // =========================================================================
    // Subscription Management
    // =========================================================================

    /// Subscribe a callback to a topic pattern.
    ///
    /// The handler runs inline during [`emit`](Self::emit) for every event
    /// whose type matches `pattern`. Returns a receipt for unsubscribing.
    pub async fn on(
        &self,
        pattern: &str,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let parsed = TopicPattern::parse(pattern)?;
        let id = SubscriptionId::generate();

        let mut handlers = self.handlers.write().await;
        handlers.push(HandlerEntry {
            id: id.clone(),
            pattern: parsed,
            sink: Sink::Callback(Arc::new(handler)),
        });

        // Update stats
        let mut stats = self.stats.write().await;
        stats.active_subscriptions = handlers.len();

        tracing::debug!("Handler {} registered for pattern: {}", id, pattern);

        Ok(Subscription {
            id,
            pattern: pattern.to_string(),
        })
    }

    /// Subscribe to a topic pattern via a channel.
    ///
    /// Returns (subscription handle, receiver channel); matching events are
    /// cloned into the channel in dispatch order.
    pub async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<Event>)> {
        let parsed = TopicPattern::parse(pattern)?;
        let id = SubscriptionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut handlers = self.handlers.write().await;
        handlers.push(HandlerEntry {
            id: id.clone(),
            pattern: parsed,
            sink: Sink::Channel(tx),
        });

        // Update stats
        let mut stats = self.stats.write().await;
        stats.active_subscriptions = handlers.len();

        tracing::debug!("Channel subscriber {} registered for pattern: {}", id, pattern);

        Ok((
            Subscription {
                id,
                pattern: pattern.to_string(),
            },
            rx,
        ))
    }

    /// Remove a subscription.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        handlers.retain(|entry| entry.id != subscription.id);

        // Update stats
        let mut stats = self.stats.write().await;
        stats.active_subscriptions = handlers.len();

        tracing::debug!("Unsubscribed: {}", subscription.id);

        Ok(())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Get current bus statistics.
    pub async fn get_stats(&self) -> BusStats {
        self.stats.read().await.clone()
    }

    /// Reset emission counters (subscription count is preserved).
    pub async fn reset_stats(&self) {
        let mut stats = self.stats.write().await;
        stats.events_emitted = 0;
        stats.deliveries = 0;
        stats.handler_panics = 0;
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&Event) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |event: &Event| {
            sink.lock().unwrap().push(event.event_type.clone());
        })
    }

    // =========================================================================
    // Emission Tests
    // =========================================================================

    #[tokio::test]
    async fn test_emit_to_zero_handlers() {
        let bus = EventBus::new();

        let delivered = bus
            .emit(Event::new("input:text", json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(delivered, 0);

        let stats = bus.get_stats().await;
        assert_eq!(stats.events_emitted, 1);
        assert_eq!(stats.deliveries, 0);
    }

    #[tokio::test]
    async fn test_emit_empty_event_type_rejected() {
        let bus = EventBus::new();
        let result = bus.emit(Event::new("", json!({}))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_and_emit() {
        let bus = EventBus::new();
        let (seen, handler) = recorder();

        bus.on("input:text", handler).await.unwrap();

        let delivered = bus
            .emit(Event::new("input:text", json!({"text": "hello"})))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["input:text".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_follows_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on("tick", move |_event| {
                order.lock().unwrap().push(label);
            })
            .await
            .unwrap();
        }

        bus.emit(Event::new("tick", json!({}))).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_wildcard_subscription_matches_one_segment() {
        let bus = EventBus::new();
        let (seen, handler) = recorder();

        bus.on("agent:*:response", handler).await.unwrap();

        bus.emit(Event::new("agent:builder:response", json!({})))
            .await
            .unwrap();
        bus.emit(Event::new("agent:response", json!({})))
            .await
            .unwrap();
        bus.emit(Event::new("agent:a:b:response", json!({})))
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["agent:builder:response".to_string()]
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let (seen, handler) = recorder();

        bus.on("tick", |_event| panic!("handler blew up"))
            .await
            .unwrap();
        bus.on("tick", handler).await.unwrap();

        let delivered = bus.emit(Event::new("tick", json!({}))).await.unwrap();

        // The panicking handler is not counted; the later one still ran.
        assert_eq!(delivered, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);

        let stats = bus.get_stats().await;
        assert_eq!(stats.handler_panics, 1);
        assert_eq!(stats.deliveries, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (seen, handler) = recorder();

        let subscription = bus.on("tick", handler).await.unwrap();
        assert_eq!(bus.get_stats().await.active_subscriptions, 1);

        bus.unsubscribe(&subscription).await.unwrap();
        assert_eq!(bus.get_stats().await.active_subscriptions, 0);

        let delivered = bus.emit(Event::new("tick", json!({}))).await.unwrap();
        assert_eq!(delivered, 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected() {
        let bus = EventBus::new();
        assert!(bus.on("a::b", |_event| {}).await.is_err());
        assert!(bus.subscribe("").await.is_err());
    }

    // =========================================================================
    // Channel Subscription Tests
    // =========================================================================

    #[tokio::test]
    async fn test_channel_subscription_receives_events() {
        let bus = EventBus::new();

        let (_subscription, mut rx) = bus.subscribe("input:*").await.unwrap();

        bus.emit(
            Event::new("input:text", json!({"text": "hello"})).with_source("cli"),
        )
        .await
        .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "input:text");
        assert_eq!(received.source.as_deref(), Some("cli"));
        assert_eq!(received.data["text"], "hello");
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let bus = EventBus::new();

        let (_subscription, rx) = bus.subscribe("tick").await.unwrap();
        drop(rx);

        let delivered = bus.emit(Event::new("tick", json!({}))).await.unwrap();
        assert_eq!(delivered, 0);

        let stats = bus.get_stats().await;
        assert_eq!(stats.active_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_callback_and_channel_share_dispatch_order() {
        let bus = EventBus::new();
        let (seen, handler) = recorder();

        bus.on("tick", handler).await.unwrap();
        let (_subscription, mut rx) = bus.subscribe("tick").await.unwrap();

        let delivered = bus.emit(Event::new("tick", json!({}))).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(rx.recv().await.is_some());
    }

    // =========================================================================
    // Statistics Tests
    // =========================================================================

    #[tokio::test]
    async fn test_stats_track_emissions_and_reset() {
        let bus = EventBus::new();
        let (_seen, handler) = recorder();
        bus.on("tick", handler).await.unwrap();

        for _ in 0..5 {
            bus.emit(Event::new("tick", json!({}))).await.unwrap();
        }

        let stats = bus.get_stats().await;
        assert_eq!(stats.events_emitted, 5);
        assert_eq!(stats.deliveries, 5);

        bus.reset_stats().await;

        let stats = bus.get_stats().await;
        assert_eq!(stats.events_emitted, 0);
        assert_eq!(stats.active_subscriptions, 1);
    }
}
