//! Checkpoint snapshots and the store abstraction.
//!
//! The step loop writes a [`Checkpoint`] after every completed transition
//! and reads it back when a request arrives for an existing session.
//! [`SessionLocks`] gives per-session exclusivity on top of any store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::error::CheckpointError;
use crate::interrupt::Interrupt;
use crate::message::Message;
use crate::session::{Session, StepState};

/// Durable snapshot of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub step_state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<Interrupt>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn from_session(session: &Session, pending_interrupt: Option<Interrupt>) -> Self {
        Self {
            session_id: session.id.clone(),
            messages: session.messages.clone(),
            step_state: session.state,
            pending_interrupt,
            context: session.context.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Rebuild the live session this checkpoint was taken from.
    pub fn to_session(&self) -> Session {
        Session {
            id: self.session_id.clone(),
            messages: self.messages.clone(),
            state: self.step_state,
            context: self.context.clone(),
        }
    }
}

/// Persistence for checkpoints, keyed by session id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Backend name for logging (e.g. "in_memory", "file", "sqlite").
    fn name(&self) -> &str;

    async fn get(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Replace the checkpoint for a session.
    async fn put(&self, session_id: &str, checkpoint: Checkpoint) -> Result<(), CheckpointError>;

    /// Session ids with a stored checkpoint.
    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        Ok(Vec::new())
    }
}

/// Per-session async locks.
///
/// A second request for a session waits until the guard held by the first
/// is dropped, which happens when its step loop finishes or suspends.
#[derive(Default, Clone)]
pub struct SessionLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody is holding or waiting on.
            map.retain(|_, l| Arc::strong_count(l) > 1);
            map.entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn session_roundtrip_through_checkpoint() {
        let mut session = Session::new("s1");
        session.messages.push(Message::user("10+10?"));
        session.state = StepState::AwaitingApproval;
        session
            .context
            .insert("docs".into(), serde_json::json!(["a"]));

        let checkpoint = Checkpoint::from_session(&session, None);
        assert_eq!(checkpoint.to_session(), session);
    }

    #[tokio::test(start_paused = true)]
    async fn second_lock_waits_for_first() {
        let locks = SessionLocks::new();
        let guard = locks.lock("s1").await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = locks2.lock("s1").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // A different session is not blocked.
        let _other = locks.lock("s2").await;

        drop(guard);
        waiter.await.unwrap();
    }
}
