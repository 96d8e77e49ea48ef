//! SQLite checkpoint store.
//!
//! A single `checkpoints` table keyed by session id holds the JSON snapshot
//! alongside the step state for quick inspection with the sqlite shell.

use std::str::FromStr;

use agentgate_core::checkpoint::{Checkpoint, CheckpointStore};
use agentgate_core::error::CheckpointError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Open (or create) the database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database.
    pub async fn new(path: &str) -> Result<Self, CheckpointError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| CheckpointError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| CheckpointError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite checkpoint store initialized at {path}");
        Ok(store)
    }

    /// Wrap an existing pool, running migrations first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, CheckpointError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                session_id  TEXT PRIMARY KEY NOT NULL,
                step_state  TEXT NOT NULL,
                snapshot    TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::MigrationFailed(format!("checkpoints table: {e}")))?;

        debug!("SQLite checkpoint migrations complete");
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query("SELECT snapshot FROM checkpoints WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CheckpointError::Storage(format!("Select failed: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let snapshot: String = row
            .try_get("snapshot")
            .map_err(|e| CheckpointError::Storage(format!("snapshot column: {e}")))?;

        serde_json::from_str(&snapshot)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupted {
                session_id: session_id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn put(&self, session_id: &str, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let snapshot = serde_json::to_string(&checkpoint)
            .map_err(|e| CheckpointError::Storage(format!("Snapshot serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (session_id, step_state, snapshot, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(session_id) DO UPDATE SET
                step_state = excluded.step_state,
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(checkpoint.step_state.as_str())
        .bind(&snapshot)
        .bind(checkpoint.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(format!("Upsert failed: {e}")))?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let rows = sqlx::query("SELECT session_id FROM checkpoints ORDER BY session_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CheckpointError::Storage(format!("List failed: {e}")))?;

        rows.iter()
            .map(|r| {
                r.try_get::<String, _>("session_id")
                    .map_err(|e| CheckpointError::Storage(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgate_core::{Message, Session, StepState};

    async fn test_store() -> SqliteCheckpointStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteCheckpointStore::from_pool(pool).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_and_fetch() {
        let store = test_store().await;
        assert!(store.get("s1").await.unwrap().is_none());

        let mut session = Session::new("s1");
        session.messages.push(Message::user("hi"));
        store.put("s1", Checkpoint::from_session(&session, None)).await.unwrap();

        session.messages.push(Message::assistant("hello"));
        session.state = StepState::Done;
        store.put("s1", Checkpoint::from_session(&session, None)).await.unwrap();

        let cp = store.get("s1").await.unwrap().unwrap();
        assert_eq!(cp.messages.len(), 2);
        assert_eq!(cp.step_state, StepState::Done);
        assert_eq!(store.list().await.unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn corrupted_snapshot_reported() {
        let store = test_store().await;
        sqlx::query("INSERT INTO checkpoints VALUES ('bad', 'done', '{oops', '2026-01-01T00:00:00Z')")
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(matches!(
            store.get("bad").await,
            Err(CheckpointError::Corrupted { .. })
        ));
    }
}
