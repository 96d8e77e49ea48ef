//! Domain event system: decoupled observation of the step loop.
//!
//! Events are published when something interesting happens in the engine.
//! Observers (logging sinks, metrics, tests) subscribe without the loop
//! knowing about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A model step completed
    ModelCalled {
        session_id: String,
        step: u32,
        tool_calls: usize,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        session_id: String,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The loop suspended waiting for decisions
    InterruptRaised {
        session_id: String,
        pending: usize,
        timestamp: DateTime<Utc>,
    },

    /// A resume was accepted
    SessionResumed {
        session_id: String,
        decisions: usize,
        timestamp: DateTime<Utc>,
    },

    /// A request ended with an unrecovered error
    RequestFailed {
        session_id: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Short name for logs and filters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelCalled { .. } => "model",
            Self::ToolExecuted { .. } => "tool",
            Self::InterruptRaised { .. } => "interrupt",
            Self::SessionResumed { .. } => "resumed",
            Self::RequestFailed { .. } => "failed",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::ModelCalled { session_id, .. }
            | Self::ToolExecuted { session_id, .. }
            | Self::InterruptRaised { session_id, .. }
            | Self::SessionResumed { session_id, .. }
            | Self::RequestFailed { session_id, .. } => session_id,
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Slow subscribers lag and lose the oldest events; publishing never blocks
/// the step loop.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        if self.sender.send(Arc::new(event)).is_err() {
            tracing::trace!("Domain event dropped: no subscribers");
        }
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
