//! Process-scoped event bus
//!
//! Every subsystem publishes lifecycle and execution events here. Delivery is
//! a tokio broadcast channel, so publishing never blocks and slow receivers
//! lose the oldest events instead of stalling the runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::lifecycle::RuntimeState;
use crate::types::{AsyncNodeId, LogicPointId, ScheduledTaskId};

/// Default channel capacity for the event bus.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events emitted by the runtime.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    SystemInit,
    SystemReady {
        plugins: usize,
    },
    SystemShutdown,
    StateChanged {
        from: RuntimeState,
        to: RuntimeState,
    },
    PluginLoaded {
        name: String,
        version: String,
    },
    PluginUnloaded {
        name: String,
    },
    PluginError {
        name: String,
        error: String,
    },
    FlowStarted {
        point_id: LogicPointId,
        name: String,
    },
    FlowCompleted {
        point_id: LogicPointId,
        name: String,
        #[serde(with = "humantime_serde")]
        duration: Duration,
        used_fallback: bool,
    },
    FlowFailed {
        point_id: LogicPointId,
        name: String,
        error: String,
    },
    FlowDecision {
        decision_id: LogicPointId,
        output: String,
        branch: String,
    },
    FlowCheckpoint {
        point_id: LogicPointId,
        name: String,
    },
    FlowAsyncCancelled {
        node_id: AsyncNodeId,
    },
    ActionStarted {
        name: String,
    },
    ActionCompleted {
        name: String,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    ActionFailed {
        name: String,
        error: String,
    },
    ChainStarted {
        length: usize,
    },
    ChainCompleted {
        executed: usize,
        skipped: bool,
    },
    ChainFailed {
        executed: usize,
        error: String,
    },
    TaskFired {
        task_id: ScheduledTaskId,
        name: String,
    },
    Custom {
        topic: String,
        payload: serde_json::Value,
    },
}

impl RuntimeEvent {
    /// Topic string subscribers filter on (`"system:init"`, `"flow:complete"`, ...).
    pub fn topic(&self) -> &str {
        match self {
            RuntimeEvent::SystemInit => "system:init",
            RuntimeEvent::SystemReady { .. } => "system:ready",
            RuntimeEvent::SystemShutdown => "system:shutdown",
            RuntimeEvent::StateChanged { .. } => "state:changed",
            RuntimeEvent::PluginLoaded { .. } => "plugin:loaded",
            RuntimeEvent::PluginUnloaded { .. } => "plugin:unloaded",
            RuntimeEvent::PluginError { .. } => "plugin:error",
            RuntimeEvent::FlowStarted { .. } => "flow:start",
            RuntimeEvent::FlowCompleted { .. } => "flow:complete",
            RuntimeEvent::FlowFailed { .. } => "flow:error",
            RuntimeEvent::FlowDecision { .. } => "flow:decision",
            RuntimeEvent::FlowCheckpoint { .. } => "flow:checkpoint",
            RuntimeEvent::FlowAsyncCancelled { .. } => "flow:cancelled",
            RuntimeEvent::ActionStarted { .. } => "action:start",
            RuntimeEvent::ActionCompleted { .. } => "action:complete",
            RuntimeEvent::ActionFailed { .. } => "action:error",
            RuntimeEvent::ChainStarted { .. } => "chain:start",
            RuntimeEvent::ChainCompleted { .. } => "chain:complete",
            RuntimeEvent::ChainFailed { .. } => "chain:error",
            RuntimeEvent::TaskFired { .. } => "scheduler:fired",
            RuntimeEvent::Custom { topic, .. } => topic,
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RuntimeEvent,
}

impl EventEnvelope {
    pub fn topic(&self) -> &str {
        self.event.topic()
    }
}

/// Broadcast bus shared by all subsystems. Clones share one channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<EventEnvelope>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
        }
    }

    /// Publish an event, returning how many receivers got it.
    pub fn publish(&self, event: RuntimeEvent) -> usize {
        let envelope = Arc::new(EventEnvelope {
            timestamp: Utc::now(),
            event,
        });
        match self.sender.send(Arc::clone(&envelope)) {
            Ok(count) => {
                tracing::trace!("Published {} to {} receivers", envelope.topic(), count);
                count
            }
            Err(_) => 0,
        }
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            pattern: None,
        }
    }

    /// Subscribe to one topic, or to a family with a trailing `*` (`"flow:*"`).
    pub fn subscribe_topic(&self, pattern: impl Into<String>) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            pattern: Some(pattern.into()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a bus subscription.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<EventEnvelope>>,
    pattern: Option<String>,
}

impl EventReceiver {
    fn matches(&self, envelope: &EventEnvelope) -> bool {
        match &self.pattern {
            None => true,
            Some(pattern) => topic_matches(pattern, envelope.topic()),
        }
    }

    /// Wait for the next matching event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Arc<EventEnvelope>> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    if self.matches(&envelope) {
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    tracing::warn!("Event receiver lagged, {} events dropped", count);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`EventReceiver::recv`].
    pub fn try_recv(&mut self) -> Option<Arc<EventEnvelope>> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => {
                    if self.matches(&envelope) {
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    tracing::warn!("Event receiver lagged, {} events dropped", count);
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<Arc<EventEnvelope>> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Exact match, or prefix match when the pattern ends with `*`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}
