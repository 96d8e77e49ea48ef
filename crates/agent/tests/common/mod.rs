//! Scripted provider shared by the engine integration tests.

#![allow(dead_code)]

use std::sync::Mutex;

use agentgate_core::error::ProviderError;
use agentgate_core::message::Message;
use agentgate_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use agentgate_core::tool::ToolCall;

/// Returns scripted responses in sequence and records every request.
pub struct ScriptedProvider {
    responses: Mutex<Vec<ProviderResponse>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len()
        };
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(ProviderError::NotConfigured(format!(
                "ScriptedProvider exhausted at call #{call}"
            )));
        }
        Ok(responses.remove(0))
    }
}

pub fn text(content: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(content),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock".into(),
    }
}

pub fn tool(id: &str, name: &str, args: serde_json::Value) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_tool_calls("", vec![ToolCall::new(id, name, args)]),
        usage: None,
        model: "mock".into(),
    }
}
