//! Builds the engine described by an [`AppConfig`].
//!
//! Provider, tools, checkpoint store, vector store and middleware chain are
//! created once here and shared by every request. The CLI reuses these
//! builders for its terminal front-ends.

use std::sync::Arc;

use agentgate_agent::{AgentRunner, MiddlewareChain};
use agentgate_config::{AppConfig, CheckpointBackend};
use agentgate_core::checkpoint::CheckpointStore;
use agentgate_core::error::{CheckpointError, Result};
use agentgate_core::provider::Provider;
use agentgate_core::retrieval::VectorStore;
use agentgate_core::tool::ToolRegistry;
use agentgate_memory::{
    FileCheckpointStore, InMemoryCheckpointStore, InMemoryVectorStore, SqliteCheckpointStore,
};
use tracing::{info, warn};

/// Open the checkpoint backend selected by `[checkpoint]`.
pub async fn checkpoint_store(config: &AppConfig) -> Result<Arc<dyn CheckpointStore>> {
    let path = config.checkpoint.resolved_path();
    let store: Arc<dyn CheckpointStore> = match config.checkpoint.backend {
        CheckpointBackend::Memory => Arc::new(InMemoryCheckpointStore::new()),
        CheckpointBackend::File => {
            info!(dir = %path.display(), "Using file checkpoint store");
            Arc::new(FileCheckpointStore::new(path))
        }
        CheckpointBackend::Sqlite => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CheckpointError::Storage(format!("{}: {e}", parent.display())))?;
            }
            Arc::new(SqliteCheckpointStore::new(&path.to_string_lossy()).await?)
        }
    };
    Ok(store)
}

/// Build the vector store for the retrieval middleware.
///
/// Returns `None` when retrieval is disabled.
pub async fn vector_store(
    config: &AppConfig,
    provider: Arc<dyn Provider>,
) -> Result<Option<Arc<dyn VectorStore>>> {
    if !config.retrieval.enabled {
        return Ok(None);
    }
    let store = match &config.retrieval.embedding_model {
        Some(model) => InMemoryVectorStore::with_embeddings(provider, model.clone()),
        None => InMemoryVectorStore::new(),
    };
    match &config.retrieval.documents_path {
        Some(path) => {
            let count = store.load_jsonl(path).await?;
            info!(path = %path.display(), documents = count, "Retrieval corpus loaded");
        }
        None => warn!("Retrieval is enabled but no documents_path is set; answers will cite nothing"),
    }
    Ok(Some(Arc::new(store)))
}

/// Assemble a ready-to-serve [`AgentRunner`].
pub async fn build_runner(config: &AppConfig) -> Result<AgentRunner> {
    let provider: Arc<dyn Provider> = Arc::new(agentgate_providers::build_from_config(config)?);
    let tools = Arc::new(agentgate_tools::default_registry(
        config.search.tavily_api_key.as_deref(),
    ));
    let store = checkpoint_store(config).await?;
    let vectors = vector_store(config, provider.clone()).await?;
    let chain = MiddlewareChain::from_config(config, provider.clone(), vectors);

    info!(
        model = %config.default_model,
        tools = tools.len(),
        middleware = ?chain.names(),
        "Agent runner ready"
    );
    Ok(AgentRunner::from_config(config, provider, tools, store, chain))
}

/// A tool-less runner that answers through the retrieval middleware only.
///
/// Retrieval is forced on and the approval gate is dropped, since there are
/// no tools to gate.
pub async fn build_rag_runner(config: &AppConfig) -> Result<AgentRunner> {
    let mut config = config.clone();
    config.retrieval.enabled = true;
    config.approval.interrupt_on.clear();
    config.agent.planning = false;

    let provider: Arc<dyn Provider> = Arc::new(agentgate_providers::build_from_config(&config)?);
    let store = checkpoint_store(&config).await?;
    let vectors = vector_store(&config, provider.clone()).await?;
    let chain = MiddlewareChain::from_config(&config, provider.clone(), vectors);
    Ok(AgentRunner::from_config(
        &config,
        provider,
        Arc::new(ToolRegistry::new()),
        store,
        chain,
    ))
}
