//! Session and step-state types.

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Where a session's step loop currently stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Ready for the next model call.
    #[default]
    AwaitingModel,
    /// The last assistant message requested tool calls not yet run.
    ToolCallsPending,
    /// Suspended until a resume supplies decisions.
    AwaitingApproval,
    /// Tool calls are being executed.
    ExecutingTools,
    /// The last assistant message carried no tool calls.
    Done,
    /// Every pending call was rejected and nothing else was left to run.
    Rejected,
}

impl StepState {
    /// True for states that end a request.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingModel => "awaiting_model",
            Self::ToolCallsPending => "tool_calls_pending",
            Self::AwaitingApproval => "awaiting_approval",
            Self::ExecutingTools => "executing_tools",
            Self::Done => "done",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversation thread owned by one in-flight request at a time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    pub state: StepState,
    /// Values written by middleware state updates (e.g. retrieved `docs`).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// The most recent assistant message, if any.
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::message::Role::Assistant)
    }
}
