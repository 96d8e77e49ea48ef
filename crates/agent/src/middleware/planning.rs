//! Planning reflection before every model step.
//!
//! A secondary call summarizes the conversation into a short plan. The plan
//! is appended as a user-role message tagged [`MessageOrigin::Plan`]; any
//! earlier plan message is removed first so at most one is present.

use std::sync::Arc;

use agentgate_core::error::Result;
use agentgate_core::message::{Message, MessageOrigin, transcript};
use agentgate_core::provider::Provider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CallContext, Middleware, ModelRequest, ModelResponse, Next};
use crate::structured::StructuredCall;

const NAME: &str = "planning";

pub const PLANNING_PROMPT: &str = "\
You are a planning expert. Summarize the current context and plan what should be done next.
Reply with a JSON object:
{\"thinking\": \"...\", \"completed\": [\"...\"], \"next_steps\": [\"...\"]}

Do not draw conclusions that the conversation does not already support. Plan only from what is there.";

/// The planner's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub thinking: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub completed: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub next_steps: Vec<String>,
}

impl Plan {
    /// Text of the injected plan message.
    pub fn render(&self) -> String {
        let mut out = String::from("Act on the plan below.\n");
        out.push_str(&format!("Thinking: {}\n", self.thinking));
        if !self.completed.is_empty() {
            out.push_str("Completed:\n");
            for item in &self.completed {
                out.push_str(&format!("- {item}\n"));
            }
        }
        out.push_str("Next steps:\n");
        for item in &self.next_steps {
            out.push_str(&format!("- {item}\n"));
        }
        out.trim_end().to_string()
    }
}

/// Models sometimes answer a list field with a single string.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) if s.trim().is_empty() => Vec::new(),
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

pub struct PlanningMiddleware {
    secondary: StructuredCall,
}

impl PlanningMiddleware {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            secondary: StructuredCall::new(provider, model, NAME),
        }
    }

    async fn plan(&self, messages: &[Message]) -> Result<Plan> {
        self.secondary
            .json(vec![
                Message::system(PLANNING_PROMPT),
                Message::user(format!(
                    "Conversation so far:\n{}\n\nPlan:",
                    transcript(messages)
                )),
            ])
            .await
    }
}

#[async_trait]
impl Middleware for PlanningMiddleware {
    fn name(&self) -> &str {
        NAME
    }

    async fn intercept(
        &self,
        mut request: ModelRequest,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<ModelResponse> {
        request.messages.retain(|m| m.origin != MessageOrigin::Plan);
        let plan = self.plan(&request.messages).await?;
        debug!(
            session_id = %ctx.session_id,
            step = ctx.step,
            next_steps = plan.next_steps.len(),
            "Planned next step"
        );
        request.messages.push(Message::plan(plan.render()));
        next.run(request, ctx).await
    }
}
