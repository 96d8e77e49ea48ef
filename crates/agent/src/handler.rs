//! The innermost handler of the chain: a streamed provider call.

use std::sync::Arc;

use agentgate_core::error::{Error, ProviderError, Result};
use agentgate_core::message::Message;
use agentgate_core::provider::{Provider, ProviderRequest};
use async_trait::async_trait;
use tracing::debug;

use crate::middleware::{CallContext, ModelHandler, ModelRequest, ModelResponse};
use crate::stream_event::{EventSink, StreamEvent};

/// Streams one completion, forwarding text deltas as `token` events.
pub struct ProviderHandler<'a> {
    pub provider: &'a Arc<dyn Provider>,
    pub model: &'a str,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub sink: &'a EventSink,
    /// Id given to the assistant message being generated.
    pub msg_id: &'a str,
}

impl ProviderHandler<'_> {
    fn provider_request(&self, request: ModelRequest) -> ProviderRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(Message::system(request.system_prompt));
        }
        messages.extend(request.messages);

        ProviderRequest {
            model: self.model.to_string(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: request.tools,
            stream: true,
        }
    }
}

#[async_trait]
impl ModelHandler for ProviderHandler<'_> {
    async fn handle(&self, request: ModelRequest, ctx: &CallContext) -> Result<ModelResponse> {
        let request = self.provider_request(request);
        debug!(
            session_id = %ctx.session_id,
            step = ctx.step,
            provider = self.provider.name(),
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Calling model"
        );

        let mut rx = self.provider.stream(request).await?;
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = None;

        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.content.filter(|d| !d.is_empty()) {
                content.push_str(&delta);
                self.sink
                    .emit(StreamEvent::Token {
                        text: delta,
                        msg_id: self.msg_id.to_string(),
                    })
                    .await?;
            }
            tool_calls.extend(chunk.tool_calls);
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if chunk.done {
                break;
            }
        }

        let mut message = Message::assistant_with_tool_calls(content, tool_calls);
        message.id = self.msg_id.to_string();
        if !message.is_well_formed() {
            return Err(Error::ModelInvocation(ProviderError::StreamInterrupted(
                "model returned neither text nor tool calls".into(),
            )));
        }

        let mut response = ModelResponse::new(message);
        response.usage = usage;
        Ok(response)
    }
}
