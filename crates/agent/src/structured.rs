//! Secondary model calls with JSON replies.
//!
//! Routing and planning ask the model for a small JSON object. Models often
//! wrap it in a fenced block or add a sentence before it, so the first
//! balanced object in the reply is what gets parsed.

use std::sync::Arc;

use agentgate_core::error::{Error, Result};
use agentgate_core::message::Message;
use agentgate_core::provider::{Provider, ProviderRequest};
use serde::de::DeserializeOwned;
use tracing::debug;

/// A non-streaming helper call made on behalf of one middleware.
#[derive(Clone)]
pub struct StructuredCall {
    provider: Arc<dyn Provider>,
    model: String,
    caller: String,
}

impl StructuredCall {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        caller: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            caller: caller.into(),
        }
    }

    /// Complete `messages` and return the reply text.
    pub async fn text(&self, messages: Vec<Message>) -> Result<String> {
        let mut request = ProviderRequest::new(&self.model, messages);
        request.temperature = 0.0;
        let response = self
            .provider
            .complete(request)
            .await
            .map_err(|e| Error::middleware(&self.caller, format!("secondary model call failed: {e}")))?;
        Ok(response.message.content.trim().to_string())
    }

    /// Complete `messages` and parse the first JSON object in the reply.
    pub async fn json<T: DeserializeOwned>(&self, messages: Vec<Message>) -> Result<T> {
        let reply = self.text(messages).await?;
        debug!(middleware = %self.caller, reply = %reply, "Structured reply");
        parse_object(&reply).map_err(|reason| Error::middleware(&self.caller, reason))
    }
}

/// Parse the first JSON object found in `text`.
pub fn parse_object<T: DeserializeOwned>(text: &str) -> std::result::Result<T, String> {
    let object = extract_json_object(text)
        .ok_or_else(|| format!("no JSON object in model reply: {text:?}"))?;
    serde_json::from_str(object).map_err(|e| format!("malformed JSON object in model reply: {e}"))
}

/// Locate the first balanced `{...}` in `text`, skipping braces inside strings.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
