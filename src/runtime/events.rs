//! Lifecycle events and the sinks that deliver them
//!
//! Publishing is fire-and-forget: the engine never waits on a subscriber.
//! The channel sink is bounded and drops events (with a warning) when the
//! consumer falls behind.

use crate::workflow::types::WorkflowTask;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Event published at every instance or task lifecycle transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum WorkflowEvent {
    #[serde(rename = "workflow:started")]
    WorkflowStarted {
        instance_id: String,
        workflow_id: String,
        initiator: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "workflow:completed")]
    WorkflowCompleted {
        instance_id: String,
        workflow_id: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "workflow:failed")]
    WorkflowFailed {
        instance_id: String,
        workflow_id: String,
        node_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "workflow:canceled")]
    WorkflowCanceled {
        instance_id: String,
        workflow_id: String,
        actor: String,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    #[serde(rename = "workflow:suspended")]
    WorkflowSuspended {
        instance_id: String,
        workflow_id: String,
        actor: String,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    #[serde(rename = "task:created")]
    TaskCreated { task: WorkflowTask },
    #[serde(rename = "task:completed")]
    TaskCompleted { task: WorkflowTask, actor: String },
    #[serde(rename = "task:rejected")]
    TaskRejected { task: WorkflowTask, actor: String },
    #[serde(rename = "task:canceled")]
    TaskCanceled { task: WorkflowTask },
}

impl WorkflowEvent {
    /// Wire name of the event, e.g. `workflow:started`
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow:started",
            Self::WorkflowCompleted { .. } => "workflow:completed",
            Self::WorkflowFailed { .. } => "workflow:failed",
            Self::WorkflowCanceled { .. } => "workflow:canceled",
            Self::WorkflowSuspended { .. } => "workflow:suspended",
            Self::TaskCreated { .. } => "task:created",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskRejected { .. } => "task:rejected",
            Self::TaskCanceled { .. } => "task:canceled",
        }
    }

    /// Instance the event belongs to
    pub fn instance_id(&self) -> &str {
        match self {
            Self::WorkflowStarted { instance_id, .. }
            | Self::WorkflowCompleted { instance_id, .. }
            | Self::WorkflowFailed { instance_id, .. }
            | Self::WorkflowCanceled { instance_id, .. }
            | Self::WorkflowSuspended { instance_id, .. } => instance_id,
            Self::TaskCreated { task }
            | Self::TaskCompleted { task, .. }
            | Self::TaskRejected { task, .. }
            | Self::TaskCanceled { task } => &task.instance_id,
        }
    }
}

/// Boundary through which lifecycle events leave the engine
pub trait EventSink: Send + Sync {
    /// Must not block
    fn publish(&self, event: WorkflowEvent);
}

/// Sink that discards everything
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _event: WorkflowEvent) {}
}

/// Bounded channel sink; the receiving half is handed to the consumer
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::Sender<WorkflowEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkflowEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: WorkflowEvent) {
        let name = event.name();
        match self.sender.try_send(event) {
            Ok(()) => tracing::trace!(event = name, "event published"),
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    event = name,
                    instance_id = event.instance_id(),
                    "event channel full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(event = name, "event channel closed");
            }
        }
    }
}

/// Sink that keeps every event in memory, for tests and embedding
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Event names in publication order
    pub fn names(&self) -> Vec<&'static str> {
        self.events()
            .iter()
            .map(WorkflowEvent::name)
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&self, event: WorkflowEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
