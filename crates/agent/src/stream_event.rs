//! Events streamed to the caller while a request runs.
//!
//! Every event serializes as `{"event": <name>, "data": {...}}`. The gateway
//! forwards each one as an SSE `data:` line. A request ends with exactly one
//! of `done`, `__interrupt__` or `error`.

use agentgate_core::error::{Error, Result};
use agentgate_core::interrupt::Interrupt;
use agentgate_core::session::StepState;
use agentgate_core::tool::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted by the step loop, in production order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum StreamEvent {
    /// A text delta of the assistant message `msg_id`.
    #[serde(rename = "token")]
    Token {
        #[serde(rename = "token")]
        text: String,
        #[serde(rename = "id")]
        msg_id: String,
    },

    /// The assistant message `msg_id` requested these tool calls.
    #[serde(rename = "tool_calls")]
    ToolCallsAnnounced {
        #[serde(rename = "tool_calls")]
        calls: Vec<ToolCall>,
        #[serde(rename = "id")]
        msg_id: String,
    },

    /// Results of one batch, in the order the calls were emitted.
    #[serde(rename = "tool_output")]
    ToolOutput {
        #[serde(rename = "tool_output")]
        results: Vec<ToolResult>,
    },

    /// The loop suspended waiting for decisions.
    #[serde(rename = "__interrupt__")]
    Interrupted {
        #[serde(rename = "__interrupt__")]
        interrupt: Interrupt,
    },

    /// The loop reached a terminal state.
    #[serde(rename = "done")]
    Done { session_id: String, state: StepState },

    /// The request failed; the checkpoint holds the last committed state.
    #[serde(rename = "error")]
    Error { message: String },
}

impl StreamEvent {
    /// Wire name of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::ToolCallsAnnounced { .. } => "tool_calls",
            Self::ToolOutput { .. } => "tool_output",
            Self::Interrupted { .. } => "__interrupt__",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// True for the events that end a request.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Interrupted { .. } | Self::Done { .. } | Self::Error { .. }
        )
    }
}

/// Sending half of a request's event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }

    /// A sink and its receiver with the given buffer.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    /// Send one event. Fails with [`Error::Cancelled`] once the receiver is gone.
    pub async fn emit(&self, event: StreamEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| Error::Cancelled)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
