//! `web_search`: internet search through the Tavily API.
//!
//! Only registered when an API key is configured; the search tool filter
//! removes it from individual requests that disable internet search.

use std::time::Duration;

use agentgate_core::error::ToolError;
use agentgate_core::tool::{Tool, ToolArguments};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const NAME: &str = "web_search";

const TAVILY_URL: &str = "https://api.tavily.com/search";

pub struct WebSearchTool {
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(api_key, TAVILY_URL)
    }

    /// Point the tool at a different search endpoint.
    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: u64,
    search_depth: &'a str,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

fn render(response: &SearchResponse) -> String {
    let mut out = String::new();
    if let Some(answer) = response.answer.as_deref().filter(|a| !a.is_empty()) {
        out.push_str(&format!("Answer: {answer}\n\n"));
    }
    if response.results.is_empty() {
        out.push_str("No results found.");
        return out;
    }
    for (i, hit) in response.results.iter().enumerate() {
        out.push_str(&format!("[{}] {}\n{}\n{}\n\n", i + 1, hit.title, hit.url, hit.content));
    }
    out.trim_end().to_string()
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Search the internet for current information. Returns titles, URLs and snippets."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Number of results to return (default 5)",
                    "default": 5
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<String, ToolError> {
        let query = arguments
            .get("query")
            .and_then(|v| v.as_str())
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'query' argument".into()))?;
        let max_results = arguments
            .get("max_results")
            .and_then(|v| v.as_u64())
            .unwrap_or(5)
            .clamp(1, 10);

        debug!(query, max_results, "Running web search");

        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: NAME.into(),
            reason,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(Duration::from_secs(30))
            .json(&SearchRequest {
                api_key: &self.api_key,
                query,
                max_results,
                search_depth: "basic",
            })
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failed(format!("search API returned {status}: {body}")));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| failed(format!("unreadable search response: {e}")))?;
        Ok(render(&parsed))
    }
}
