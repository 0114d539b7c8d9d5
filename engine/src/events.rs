//! Step lifecycle event bus
//!
//! The executor publishes a `created`, `started`, and `completed` or
//! `failed` event for every step, in that order, exactly once each,
//! regardless of concurrency mode. Consumers (CLI progress output,
//! dashboards) subscribe; the executor has no dependency on what they do
//! with events. Channels are bounded to prevent unbounded memory growth.

use chrono::{DateTime, Utc};
use sdk::types::{Role, Usage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Channel buffer size for bounded subscriber channels
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Kind of step lifecycle event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepEventKind {
    /// Step exists and is pending
    Created,
    /// Step began executing
    Started,
    /// Step finished successfully
    Completed,
    /// Step failed
    Failed,
}

/// One step lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    /// Owning task id
    pub task_id: String,

    /// Step id
    pub step_id: String,

    /// Step role
    pub role: Role,

    /// Event kind
    pub kind: StepEventKind,

    /// When the event was emitted
    pub timestamp: DateTime<Utc>,

    /// Resource usage, present on `Completed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Error message, present on `Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepEvent {
    /// Build an event stamped with the current time
    pub fn now(task_id: &str, step_id: &str, role: Role, kind: StepEventKind) -> Self {
        Self {
            task_id: task_id.to_string(),
            step_id: step_id.to_string(),
            role,
            kind,
            timestamp: Utc::now(),
            usage: None,
            error: None,
        }
    }

    /// Attach usage (completed events)
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Attach an error message (failed events)
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Event bus for step lifecycle notifications
///
/// Subscribers each get a bounded channel. Publishing never blocks the
/// executor on a slow consumer: if a subscriber's channel is full or
/// closed, the event is dropped for that subscriber.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<StepEvent>>>>,
}

impl EventBus {
    /// Create a new event bus with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to all step events
    ///
    /// Returns a receiver with a bounded buffer.
    pub async fn subscribe(&self) -> mpsc::Receiver<StepEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Publish an event to all subscribers
    pub async fn publish(&self, event: StepEvent) {
        let subscribers = self.subscribers.lock().await;
        for tx in subscribers.iter() {
            // Ignore send errors (subscriber may have dropped its receiver
            // or fallen behind)
            let _ = tx.try_send(event.clone());
        }
    }
}
