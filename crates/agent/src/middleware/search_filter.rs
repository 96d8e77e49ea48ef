//! Drops the internet search tool when the caller disallows it.

use agentgate_core::error::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{CallContext, Middleware, ModelRequest, ModelResponse, Next};

pub struct SearchToolFilter {
    tool_name: String,
}

impl SearchToolFilter {
    pub fn new() -> Self {
        Self::for_tool(agentgate_tools::web_search::NAME)
    }

    /// Filter a differently named search tool.
    pub fn for_tool(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
        }
    }
}

impl Default for SearchToolFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for SearchToolFilter {
    fn name(&self) -> &str {
        "search_tool_filter"
    }

    async fn intercept(
        &self,
        mut request: ModelRequest,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<ModelResponse> {
        if !ctx.flags.internet_search {
            debug!(session_id = %ctx.session_id, tool = %self.tool_name, "Internet search disabled for this call");
            request.remove_tool(&self.tool_name);
        }
        next.run(request, ctx).await
    }
}
