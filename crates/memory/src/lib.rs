//! Checkpoint stores and the in-memory vector store for agentgate.

pub mod file_backend;
pub mod in_memory;
pub mod vector;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file_backend::FileCheckpointStore;
pub use in_memory::InMemoryCheckpointStore;
pub use vector::{Document, InMemoryVectorStore, cosine_similarity, keyword_score};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCheckpointStore;
