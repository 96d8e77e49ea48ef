//! Interrupt and decision types for the approval protocol.

use serde::{Deserialize, Serialize};

use crate::tool::{ToolArguments, ToolCall};

/// A suspension point: gated tool calls waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub session_id: String,
    /// The gated calls, in the order the model emitted them.
    pub pending_tool_calls: Vec<ToolCall>,
    pub reason: String,
    /// Allowed decision types per pending call, index-aligned.
    #[serde(default)]
    pub allowed_decisions: Vec<Vec<DecisionKind>>,
}

impl Interrupt {
    pub fn new(
        session_id: impl Into<String>,
        pending_tool_calls: Vec<ToolCall>,
        allowed_decisions: Vec<Vec<DecisionKind>>,
    ) -> Self {
        let names: Vec<&str> = pending_tool_calls.iter().map(|c| c.name.as_str()).collect();
        Self {
            session_id: session_id.into(),
            reason: format!("Tool execution requires approval: {}", names.join(", ")),
            pending_tool_calls,
            allowed_decisions,
        }
    }
}

/// The type of a human decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Approve,
    Reject,
    Edit,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Edit => "edit",
        }
    }

    /// Every decision type.
    pub fn all() -> Vec<DecisionKind> {
        vec![Self::Approve, Self::Edit, Self::Reject]
    }
}

impl std::str::FromStr for DecisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "edit" => Ok(Self::Edit),
            other => Err(format!("unknown decision type '{other}'")),
        }
    }
}

/// Replacement action for an `edit` decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditedAction {
    pub name: String,
    #[serde(default, alias = "args")]
    pub arguments: ToolArguments,
}

/// A response to one pending tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(rename = "type")]
    pub kind: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_action: Option<EditedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Decision {
    pub fn approve() -> Self {
        Self {
            kind: DecisionKind::Approve,
            edited_action: None,
            message: None,
        }
    }

    pub fn reject(message: Option<String>) -> Self {
        Self {
            kind: DecisionKind::Reject,
            edited_action: None,
            message,
        }
    }

    pub fn edit(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        let arguments = match arguments {
            serde_json::Value::Object(map) => map,
            _ => ToolArguments::new(),
        };
        Self {
            kind: DecisionKind::Edit,
            edited_action: Some(EditedAction {
                name: name.into(),
                arguments,
            }),
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decision_wire_shape() {
        let d: Decision = serde_json::from_value(json!({"type": "approve"})).unwrap();
        assert_eq!(d, Decision::approve());

        let d: Decision = serde_json::from_value(json!({
            "type": "edit",
            "edited_action": {"name": "eval_tool", "args": {"expression": "2+2"}}
        }))
        .unwrap();
        assert_eq!(d.kind, DecisionKind::Edit);
        assert_eq!(d.edited_action.unwrap().arguments["expression"], "2+2");

        let d: Decision =
            serde_json::from_value(json!({"type": "reject", "message": "no"})).unwrap();
        assert_eq!(d.message.as_deref(), Some("no"));
    }

    #[test]
    fn unknown_decision_type_fails() {
        assert!(serde_json::from_value::<Decision>(json!({"type": "maybe"})).is_err());
        assert!("maybe".parse::<DecisionKind>().is_err());
        assert_eq!(" Approve ".parse::<DecisionKind>().unwrap(), DecisionKind::Approve);
    }

    #[test]
    fn interrupt_reason_names_tools() {
        let call = ToolCall::new("c1", "eval_tool", json!({"expression": "10+10"}));
        let interrupt = Interrupt::new("s1", vec![call], vec![DecisionKind::all()]);
        assert!(interrupt.reason.contains("eval_tool"));
        assert_eq!(interrupt.pending_tool_calls.len(), 1);
    }
}
