//! File-backed checkpoint store: one JSON document per session.
//!
//! Storage location defaults to `~/.agentgate/checkpoints/`. Writes go to a
//! temporary file that is then renamed over the old snapshot, so a crash
//! mid-write never leaves a half-written checkpoint behind.

use std::path::{Path, PathBuf};

use agentgate_core::checkpoint::{Checkpoint, CheckpointStore};
use agentgate_core::error::CheckpointError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Longest escaped file stem kept as is. Longer ids are stored under a hash.
const MAX_STEM_LEN: usize = 200;

/// Prefix of hashed file stems. Never produced by escaping.
const HASHED_PREFIX: char = '~';

pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Session ids become file names; anything outside `[A-Za-z0-9_-]` is hex-escaped.
    ///
    /// Ids whose escaped form would exceed [`MAX_STEM_LEN`] are stored under
    /// `~<sha256>` instead, keeping every name within filesystem limits.
    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(session_id)))
    }
}

fn file_stem(session_id: &str) -> String {
    let mut name = String::with_capacity(session_id.len());
    for b in session_id.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => name.push(b as char),
            _ => name.push_str(&format!("%{b:02x}")),
        }
    }
    if name.len() <= MAX_STEM_LEN {
        return name;
    }
    let digest = Sha256::digest(session_id.as_bytes());
    format!("{HASHED_PREFIX}{digest:x}")
}

fn decode_name(stem: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(stem.len());
    let mut chars = stem.bytes();
    while let Some(b) = chars.next() {
        if b == b'%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let hex = [hi, lo];
            let s = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(s, 16).ok()?);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).ok()
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupted {
                session_id: session_id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn put(&self, session_id: &str, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            CheckpointError::Storage(format!("Failed to create checkpoint directory: {e}"))
        })?;

        let content = serde_json::to_string_pretty(&checkpoint)
            .map_err(|e| CheckpointError::Storage(format!("Failed to serialize checkpoint: {e}")))?;

        let path = self.path_for(session_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| CheckpointError::Storage(format!("Failed to write checkpoint: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CheckpointError::Storage(format!("Failed to commit checkpoint: {e}")))?;

        debug!(session_id, path = %path.display(), "Checkpoint written");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::Storage(e.to_string())),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?
        {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if stem.starts_with(HASHED_PREFIX) {
                // Hashed names cannot be decoded; the id lives in the snapshot.
                let content = tokio::fs::read_to_string(entry.path())
                    .await
                    .map_err(|e| CheckpointError::Storage(e.to_string()))?;
                match serde_json::from_str::<Checkpoint>(&content) {
                    Ok(cp) => ids.push(cp.session_id),
                    Err(e) => debug!(file = stem, error = %e, "Skipping unreadable checkpoint"),
                }
            } else if let Some(id) = decode_name(stem) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
