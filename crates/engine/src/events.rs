//! Lifecycle events and the sinks they are published to.
//!
//! Delivery is fire-and-forget: `EventSink::publish` is synchronous and must
//! return promptly, since it is called from the run coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Started,
    NodeCompleted,
    NodeFailed,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl ExecutionEvent {
    pub fn run(event_type: EventType, execution_id: Uuid, payload: Value) -> Self {
        Self {
            event_type,
            execution_id,
            node_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn node(
        event_type: EventType,
        execution_id: Uuid,
        node_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type,
            execution_id,
            node_id: Some(node_id.into()),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Whether this event marks the end of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type,
            EventType::Completed | EventType::Failed | EventType::Cancelled
        )
    }
}

/// Receives lifecycle events from every run. Shared across runs.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &ExecutionEvent);
}

impl<F> EventSink for F
where
    F: Fn(&ExecutionEvent) + Send + Sync,
{
    fn publish(&self, event: &ExecutionEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: &ExecutionEvent) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: &ExecutionEvent) {
        info!(
            execution_id = %event.execution_id,
            node_id = event.node_id.as_deref().unwrap_or("-"),
            event = ?event.event_type,
            payload = %event.payload,
            "execution event"
        );
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: &ExecutionEvent) {
        if self.tx.send(event.clone()).is_err() {
            warn!(execution_id = %event.execution_id, "event receiver dropped");
        }
    }
}
