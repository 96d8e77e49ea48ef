//! The agentgate execution engine.
//!
//! A request for a session either carries a new user query or resumes a
//! suspended one with approval decisions. The [`AgentRunner`] then:
//!
//! 1. **Calls the model** through the [`MiddlewareChain`] (retrieval,
//!    planning, tool filtering and the approval gate all live there)
//! 2. **Stops** when the answer has no tool calls
//! 3. **Suspends** when any tool call needs approval, writing an interrupt
//!    into the checkpoint
//! 4. **Executes** the tool calls concurrently, commits results in order,
//!    and goes back to step 1
//!
//! Every step is streamed as a [`StreamEvent`].

pub mod clock;
pub mod handler;
pub mod middleware;
pub mod runner;
pub mod stream_event;
pub mod structured;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use middleware::{
    ApprovalPolicy, CallContext, HumanInTheLoop, Middleware, MiddlewareChain, ModelHandler,
    ModelRequest, ModelResponse, Next, PlanningMiddleware, RagMiddleware, RunFlags,
    SearchToolFilter,
};
pub use runner::{AgentRunner, ChatRequest};
pub use stream_event::{EventSink, StreamEvent};
pub use structured::StructuredCall;
