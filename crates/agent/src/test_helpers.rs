//! Shared test helpers for engine tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use agentgate_core::error::{ProviderError, VectorStoreError};
use agentgate_core::message::Message;
use agentgate_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage,
};
use agentgate_core::retrieval::{RetrievedDocument, VectorStore};
use agentgate_core::tool::ToolCall;
use tokio::sync::mpsc;

/// A mock provider that returns a sequence of scripted responses.
///
/// Each call to `complete` or `stream` takes the next scripted result.
/// Once the script is exhausted every call fails with `NotConfigured`.
pub struct SequentialMockProvider {
    responses: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    chunk_size: usize,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self::from_results(responses.into_iter().map(Ok).collect())
    }

    pub fn from_results(results: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
            chunk_size: 0,
        }
    }

    /// Split streamed text into chunks of `size` characters.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len()
        };
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::NotConfigured(format!(
                    "SequentialMockProvider: no response for call #{call}"
                )))
            })
    }
}

#[async_trait::async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.next(request)
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let response = self.next(request)?;
        let text: Vec<char> = response.message.content.chars().collect();
        let pieces: Vec<String> = if self.chunk_size == 0 || text.is_empty() {
            vec![response.message.content.clone()]
        } else {
            text.chunks(self.chunk_size)
                .map(|c| c.iter().collect())
                .collect()
        };

        let (tx, rx) = mpsc::channel(pieces.len() + 1);
        for piece in pieces {
            let _ = tx
                .send(Ok(StreamChunk {
                    content: Some(piece),
                    ..Default::default()
                }))
                .await;
        }
        let _ = tx
            .send(Ok(StreamChunk {
                content: None,
                tool_calls: response.message.tool_calls,
                done: true,
                usage: response.usage,
            }))
            .await;
        Ok(rx)
    }
}

fn usage() -> Option<Usage> {
    Some(Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    })
}

/// Create a simple text response (no tool calls).
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: usage(),
        model: "mock-model".into(),
    }
}

/// Create a response with tool calls and optional thought content.
pub fn make_tool_call_response(tool_calls: Vec<ToolCall>, thought: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_tool_calls(thought, tool_calls),
        usage: usage(),
        model: "mock-model".into(),
    }
}

/// Helper to create a tool call.
pub fn make_tool_call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall::new(id, name, args)
}

/// A vector store that returns its documents in order and records queries.
pub struct MockVectorStore {
    documents: Vec<String>,
    queries: Mutex<Vec<String>>,
}

impl MockVectorStore {
    pub fn new(documents: &[&str]) -> Self {
        Self {
            documents: documents.iter().map(|d| d.to_string()).collect(),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl VectorStore for MockVectorStore {
    fn name(&self) -> &str {
        "mock"
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>, VectorStoreError> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(self
            .documents
            .iter()
            .take(k)
            .enumerate()
            .map(|(i, content)| RetrievedDocument {
                content: content.clone(),
                source: Some(format!("doc-{i}")),
                score: 1.0 - i as f32 * 0.1,
            })
            .collect())
    }
}
