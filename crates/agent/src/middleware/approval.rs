//! Human-in-the-loop approval gate.
//!
//! After the model answers, every tool call whose name appears in the
//! policy is marked as requiring approval. The step loop suspends on any
//! marked call before executing anything from the batch.

use std::collections::BTreeMap;

use agentgate_core::error::Result;
use agentgate_core::interrupt::DecisionKind;
use agentgate_core::tool::ToolCall;
use async_trait::async_trait;
use tracing::debug;

use super::{CallContext, Middleware, ModelRequest, ModelResponse, Next};

/// Tool name → decision types a human may give for it.
#[derive(Debug, Clone, Default)]
pub struct ApprovalPolicy {
    interrupt_on: BTreeMap<String, Vec<DecisionKind>>,
}

impl ApprovalPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate `tool` with the given allowed decisions. An empty list allows all.
    pub fn gate(mut self, tool: impl Into<String>, allowed: Vec<DecisionKind>) -> Self {
        let allowed = if allowed.is_empty() {
            DecisionKind::all()
        } else {
            allowed
        };
        self.interrupt_on.insert(tool.into(), allowed);
        self
    }

    pub fn from_map(interrupt_on: BTreeMap<String, Vec<DecisionKind>>) -> Self {
        interrupt_on
            .into_iter()
            .fold(Self::new(), |policy, (tool, allowed)| policy.gate(tool, allowed))
    }

    /// Allowed decisions for `tool`, or `None` when it is ungated.
    pub fn allowed_for(&self, tool: &str) -> Option<&[DecisionKind]> {
        self.interrupt_on.get(tool).map(Vec::as_slice)
    }

    pub fn is_gated(&self, tool: &str) -> bool {
        self.interrupt_on.contains_key(tool)
    }

    pub fn is_empty(&self) -> bool {
        self.interrupt_on.is_empty()
    }
}

/// Middleware that marks gated tool calls on the model response.
pub struct HumanInTheLoop {
    policy: ApprovalPolicy,
}

impl HumanInTheLoop {
    pub fn new(policy: ApprovalPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    fn mark(&self, calls: &[ToolCall], response: &mut ModelResponse) {
        for call in calls {
            if let Some(allowed) = self.policy.allowed_for(&call.name) {
                response
                    .requires_approval
                    .insert(call.id.clone(), allowed.to_vec());
            }
        }
    }
}

#[async_trait]
impl Middleware for HumanInTheLoop {
    fn name(&self) -> &str {
        "human_in_the_loop"
    }

    async fn intercept(
        &self,
        request: ModelRequest,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<ModelResponse> {
        let mut response = next.run(request, ctx).await?;
        let calls = response.message.tool_calls.clone();
        self.mark(&calls, &mut response);
        if !response.requires_approval.is_empty() {
            debug!(
                session_id = %ctx.session_id,
                gated = response.requires_approval.len(),
                "Tool calls require approval"
            );
        }
        Ok(response)
    }
}
