//! In-memory vector store for retrieval.
//!
//! Documents are scored by cosine similarity when an embedding provider is
//! attached, otherwise by keyword overlap with the query.

use std::path::Path;
use std::sync::Arc;

use agentgate_core::error::VectorStoreError;
use agentgate_core::provider::{EmbeddingRequest, Provider};
use agentgate_core::retrieval::{RetrievedDocument, VectorStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length, empty, or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (dot, norm_a, norm_b) = a.iter().zip(b).fold((0.0f64, 0.0f64, 0.0f64), |(d, na, nb), (x, y)| {
        let (x, y) = (*x as f64, *y as f64);
        (d + x * y, na + x * x, nb + y * y)
    });

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    (dot / denom) as f32
}

/// Fraction of query terms that occur in `content` (case-insensitive).
pub fn keyword_score(query: &str, content: &str) -> f32 {
    let terms = terms(query);
    if terms.is_empty() {
        return 0.0;
    }
    let content = content.to_lowercase();
    let hits = terms.iter().filter(|t| content.contains(t.as_str())).count();
    hits as f32 / terms.len() as f32
}

fn terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

/// A stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: None,
            embedding: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

struct Embedder {
    provider: Arc<dyn Provider>,
    model: String,
}

impl Embedder {
    async fn embed(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>, VectorStoreError> {
        let expected = inputs.len();
        let response = self
            .provider
            .embed(EmbeddingRequest {
                model: self.model.clone(),
                inputs,
            })
            .await
            .map_err(|e| VectorStoreError::EmbeddingFailed(e.to_string()))?;
        if response.embeddings.len() != expected {
            return Err(VectorStoreError::EmbeddingFailed(format!(
                "expected {expected} embeddings, got {}",
                response.embeddings.len()
            )));
        }
        Ok(response.embeddings)
    }
}

/// A vector store holding all documents in memory.
pub struct InMemoryVectorStore {
    documents: RwLock<Vec<Document>>,
    embedder: Option<Embedder>,
}

impl InMemoryVectorStore {
    /// A keyword-scored store.
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(Vec::new()),
            embedder: None,
        }
    }

    /// A store that embeds documents and queries with `provider`.
    pub fn with_embeddings(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            documents: RwLock::new(Vec::new()),
            embedder: Some(Embedder {
                provider,
                model: model.into(),
            }),
        }
    }

    /// Add documents, embedding any that lack a vector when an embedder is attached.
    pub async fn add_documents(&self, mut docs: Vec<Document>) -> Result<usize, VectorStoreError> {
        if let Some(embedder) = &self.embedder {
            let missing: Vec<usize> = (0..docs.len()).filter(|&i| docs[i].embedding.is_none()).collect();
            if !missing.is_empty() {
                let inputs = missing.iter().map(|&i| docs[i].content.clone()).collect();
                let vectors = embedder.embed(inputs).await?;
                for (i, v) in missing.into_iter().zip(vectors) {
                    docs[i].embedding = Some(v);
                }
            }
        }
        let added = docs.len();
        self.documents.write().await.extend(docs);
        Ok(added)
    }

    /// Load a JSONL corpus of `{"content": ..., "source": ...}` lines.
    pub async fn load_jsonl(&self, path: &Path) -> Result<usize, VectorStoreError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| VectorStoreError::LoadFailed(format!("{}: {e}", path.display())))?;

        let docs: Vec<Document> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Document>(line) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed corpus line");
                    None
                }
            })
            .collect();

        let added = self.add_documents(docs).await?;
        debug!(path = %path.display(), count = added, "Corpus loaded");
        Ok(added)
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<RetrievedDocument>, VectorStoreError> {
        let query_embedding = match &self.embedder {
            Some(embedder) => embedder.embed(vec![query.to_string()]).await?.pop(),
            None => None,
        };

        let documents = self.documents.read().await;
        let mut scored: Vec<RetrievedDocument> = documents
            .iter()
            .map(|doc| {
                let score = match (&query_embedding, &doc.embedding) {
                    (Some(q), Some(d)) => cosine_similarity(q, d),
                    _ => keyword_score(query, &doc.content),
                };
                RetrievedDocument {
                    content: doc.content.clone(),
                    source: doc.source.clone(),
                    score,
                }
            })
            .collect();

        // Stable sort keeps insertion order among equal scores.
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}
