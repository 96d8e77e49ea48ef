//! Vector store abstraction used by the retrieval middleware.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VectorStoreError;

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn name(&self) -> &str;

    /// Top `k` documents for `query`, best first.
    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>, VectorStoreError>;
}
