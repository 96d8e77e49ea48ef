//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act: evaluate arithmetic,
//! search the web, and so on. The step loop only ever talks to the
//! [`ToolRegistry`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// Tool arguments: a JSON object keyed by parameter name.
pub type ToolArguments = serde_json::Map<String, serde_json::Value>;

/// A model-requested invocation of a named tool. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON object
    #[serde(default)]
    pub arguments: ToolArguments,
}

impl ToolCall {
    /// Build a call from any JSON value; non-object values yield empty arguments.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        let name = name.into();
        let arguments = match arguments {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => ToolArguments::new(),
            other => {
                warn!(tool = %name, value = %other, "Tool arguments are not a JSON object, dropping");
                ToolArguments::new()
            }
        };
        Self {
            id: id.into(),
            name,
            arguments,
        }
    }

    /// Parse the raw JSON argument string a provider returns.
    pub fn from_raw(id: impl Into<String>, name: impl Into<String>, raw_arguments: &str) -> Self {
        let value = if raw_arguments.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(raw_arguments).unwrap_or_else(|e| {
                warn!(error = %e, "Unparseable tool arguments, using empty object");
                serde_json::Value::Null
            })
        };
        Self::new(id, name, value)
    }

    /// Arguments serialized back to a JSON string.
    pub fn arguments_json(&self) -> String {
        serde_json::Value::Object(self.arguments.clone()).to_string()
    }
}

/// The outcome of one tool call, produced exactly once per call that reaches execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub tool_call_id: String,

    /// Name of the tool that ran (or would have run)
    pub name: String,

    /// The output content
    pub content: String,

    /// False when the tool failed or the call was rejected
    #[serde(default = "default_success")]
    pub success: bool,
}

fn default_success() -> bool {
    true
}

/// The core Tool trait.
///
/// Each tool is registered in the ToolRegistry and made available to the
/// step loop.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "eval_tool", "web_search").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments and return its text output.
    async fn execute(&self, arguments: &ToolArguments) -> std::result::Result<String, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Content recorded for a tool that succeeded without printing anything.
pub const NO_OUTPUT: &str = "(no output)";

/// A registry of available tools.
///
/// Read-only after construction and shared across sessions behind an `Arc`.
/// Definitions are listed in registration order.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        if let Some(slot) = self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            *slot = tool;
        } else {
            self.tools.push(tool);
        }
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    /// Get all tool definitions (for sending to the LLM).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }

    /// Execute a tool call, surfacing any failure.
    pub async fn execute(&self, call: &ToolCall) -> std::result::Result<String, ToolError> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        tool.execute(&call.arguments).await
    }

    /// Execute a tool call, folding failures into the result content.
    ///
    /// Empty output is replaced with [`NO_OUTPUT`] so the committed tool
    /// message always carries content.
    pub async fn invoke(&self, call: &ToolCall) -> ToolResult {
        match self.execute(call).await {
            Ok(content) => ToolResult {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                content: if content.trim().is_empty() {
                    NO_OUTPUT.to_string()
                } else {
                    content
                },
                success: true,
            },
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool execution failed");
                ToolResult {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    content: format!("Error: {e}"),
                    success: false,
                }
            }
        }
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
