// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory event streaming over tokio broadcast channels. The executor,
// registry and transport publish here; the CLI and tests observe.
//
// Events are not persisted: the checkpoint store is the durable record.

use crate::domain::events::{RegistryEvent, TraceEvent, TransportEvent};
use crate::domain::execution::TraceId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Trace(TraceEvent),
    Registry(RegistryEvent),
    Transport(TransportEvent),
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Capacity is how many events are buffered before slow receivers lag.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_trace_event(&self, event: TraceEvent) {
        self.publish(DomainEvent::Trace(event));
    }

    pub fn publish_registry_event(&self, event: RegistryEvent) {
        self.publish(DomainEvent::Registry(event));
    }

    pub fn publish_transport_event(&self, event: TransportEvent) {
        self.publish(DomainEvent::Transport(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the lifecycle events of one trace only.
    pub fn subscribe_trace(&self, trace_id: TraceId) -> TraceEventReceiver {
        TraceEventReceiver {
            receiver: self.sender.subscribe(),
            trace_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to a single trace
pub struct TraceEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    trace_id: TraceId,
}

impl TraceEventReceiver {
    pub async fn recv(&mut self) -> Result<TraceEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let DomainEvent::Trace(trace_event) = event {
                if trace_event.trace_id() == self.trace_id {
                    return Ok(trace_event);
                }
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::checkpoint::NodeId;
    use chrono::Utc;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();
        event_bus.publish_registry_event(RegistryEvent::LeaseExpired {
            agent_id: "healer-7".into(),
            expired_at: Utc::now(),
        });
        match receiver.recv().await.unwrap() {
            DomainEvent::Registry(RegistryEvent::LeaseExpired { agent_id, .. }) => assert_eq!(agent_id, "healer-7"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_trace_receiver_filters_other_traces() {
        let event_bus = EventBus::new(10);
        let ours = TraceId::new();
        let mut receiver = event_bus.subscribe_trace(ours);

        event_bus.publish_trace_event(TraceEvent::TraceCompleted {
            trace_id: TraceId::new(),
            total_steps: 1,
            completed_at: Utc::now(),
        });
        event_bus.publish_trace_event(TraceEvent::StepCompleted {
            trace_id: ours,
            step_index: 0,
            node_id: NodeId::new("plan"),
            attempts: 1,
            duration_ms: 3,
            completed_at: Utc::now(),
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.trace_id(), ours);
        assert!(matches!(event, TraceEvent::StepCompleted { step_index: 0, .. }));
    }

    #[test]
    fn test_try_recv_empty_and_subscriber_count() {
        let event_bus = EventBus::default();
        assert_eq!(event_bus.subscriber_count(), 0);
        let mut receiver = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 1);
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }

    #[test]
    fn test_domain_event_serializes_with_type_tag() {
        let event = DomainEvent::Transport(TransportEvent::PublisherResumed {
            group: "healers".into(),
            pending: 8,
            resumed_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "transport");
    }
}
