//! Middleware chain wrapping every model call.
//!
//! A chain `[m1, m2, ..., mn]` around a terminal handler `H` behaves like
//! `m1(m2(...mn(H)))`: each layer sees the request as mutated by the layers
//! before it, and sees the response produced by the layers after it. Any
//! layer may return without calling [`Next::run`] to short-circuit.
//!
//! The chain is built once and shared read-only across sessions.

pub mod approval;
pub mod planning;
pub mod rag;
pub mod search_filter;

use std::collections::BTreeMap;
use std::sync::Arc;

use agentgate_config::AppConfig;
use agentgate_core::error::Result;
use agentgate_core::interrupt::DecisionKind;
use agentgate_core::message::Message;
use agentgate_core::provider::{Provider, ToolDefinition, Usage};
use agentgate_core::retrieval::VectorStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use approval::{ApprovalPolicy, HumanInTheLoop};
pub use planning::PlanningMiddleware;
pub use rag::RagMiddleware;
pub use search_filter::SearchToolFilter;

/// The mutable value threaded through the chain for one model invocation.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub system_prompt: String,
    pub extra_context: serde_json::Map<String, serde_json::Value>,
}

impl ModelRequest {
    /// The latest user message that came from the conversation itself.
    pub fn latest_user_query(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| {
            m.role == agentgate_core::message::Role::User
                && m.origin == agentgate_core::message::MessageOrigin::Conversation
        })
    }

    pub fn remove_tool(&mut self, name: &str) {
        self.tools.retain(|t| t.name != name);
    }
}

/// What the chain hands back to the step loop.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    /// The assistant message, possibly carrying tool calls.
    pub message: Message,
    pub usage: Option<Usage>,
    /// Values merged into the session context when the step commits.
    pub state_updates: serde_json::Map<String, serde_json::Value>,
    /// Tool call id → decision types allowed, for calls that need approval.
    pub requires_approval: BTreeMap<String, Vec<DecisionKind>>,
}

impl ModelResponse {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            usage: None,
            state_updates: serde_json::Map::new(),
            requires_approval: BTreeMap::new(),
        }
    }
}

/// Per-request feature flags supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFlags {
    /// Allow the `web_search` tool
    #[serde(default = "default_true")]
    pub internet_search: bool,

    /// Allow the retrieval middleware to run
    #[serde(default = "default_true")]
    pub retrieval: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RunFlags {
    fn default() -> Self {
        Self {
            internet_search: true,
            retrieval: true,
        }
    }
}

/// Ambient values for one model call, passed explicitly alongside the request.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub session_id: String,
    /// 1-based model step within the current request.
    pub step: u32,
    pub flags: RunFlags,
}

/// The innermost handler: the actual model invocation.
#[async_trait]
pub trait ModelHandler: Send + Sync {
    async fn handle(&self, request: ModelRequest, ctx: &CallContext) -> Result<ModelResponse>;
}

/// An interceptor around the model call.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &str;

    /// Observe or mutate `request`, then either delegate through `next` or
    /// return a response directly.
    async fn intercept(
        &self,
        request: ModelRequest,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<ModelResponse>;
}

/// The remainder of the chain after the current middleware.
pub struct Next<'a> {
    layers: &'a [Arc<dyn Middleware>],
    handler: &'a dyn ModelHandler,
}

impl<'a> Next<'a> {
    pub async fn run(self, request: ModelRequest, ctx: &CallContext) -> Result<ModelResponse> {
        match self.layers.split_first() {
            Some((layer, rest)) => {
                tracing::trace!(middleware = layer.name(), step = ctx.step, "Entering middleware");
                layer
                    .intercept(
                        request,
                        ctx,
                        Next {
                            layers: rest,
                            handler: self.handler,
                        },
                    )
                    .await
            }
            None => self.handler.handle(request, ctx).await,
        }
    }
}

/// An ordered list of middleware, fixed at construction.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer; layers run outermost first in insertion order.
    pub fn with(mut self, layer: impl Middleware + 'static) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    pub fn with_arc(mut self, layer: Arc<dyn Middleware>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Build the standard chain from configuration.
    ///
    /// Order: search tool filter, retrieval (when enabled and a store is
    /// given), planning (when enabled), approval gate (when any tool is gated).
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        vector_store: Option<Arc<dyn VectorStore>>,
    ) -> Self {
        let mut chain = Self::new().with(SearchToolFilter::new());

        if config.retrieval.enabled {
            match vector_store {
                Some(store) => {
                    let rag = RagMiddleware::new(store, provider.clone(), &config.default_model)
                        .with_rewrite(config.retrieval.rewrite_query)
                        .with_routing(config.retrieval.route)
                        .with_top_k(config.retrieval.top_k)
                        .with_utc_offset(config.retrieval.utc_offset_hours);
                    chain = chain.with(rag);
                }
                None => tracing::warn!("Retrieval enabled but no vector store configured, skipping"),
            }
        }

        if config.agent.planning {
            chain = chain.with(PlanningMiddleware::new(provider, &config.default_model));
        }

        if !config.approval.interrupt_on.is_empty() {
            let policy = ApprovalPolicy::from_map(config.approval.interrupt_on.clone());
            chain = chain.with(HumanInTheLoop::new(policy));
        }

        chain
    }

    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run `request` through every layer and finally `handler`.
    pub async fn run(
        &self,
        request: ModelRequest,
        ctx: &CallContext,
        handler: &dyn ModelHandler,
    ) -> Result<ModelResponse> {
        Next {
            layers: &self.layers,
            handler,
        }
        .run(request, ctx)
        .await
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
