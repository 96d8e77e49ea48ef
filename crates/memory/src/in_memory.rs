//! In-memory checkpoint store: the default for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;

use agentgate_core::checkpoint::{Checkpoint, CheckpointStore};
use agentgate_core::error::CheckpointError;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Keeps the latest checkpoint per session in a map. Lost on restart.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.read().await.get(session_id).cloned())
    }

    async fn put(&self, session_id: &str, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .write()
            .await
            .insert(session_id.to_string(), checkpoint);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids: Vec<String> = self.checkpoints.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
