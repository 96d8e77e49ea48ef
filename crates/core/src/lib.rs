//! # agentgate Core
//!
//! Domain types, traits, and error definitions for the agentgate execution
//! engine. This crate has **no framework dependencies**: it defines the
//! domain model that the provider, memory, tool, and agent crates implement
//! against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (model, tool, vector store, checkpoint store)
//! is a trait here. Implementations live in their respective crates, which
//! keeps the step loop testable with scripted stand-ins.

pub mod checkpoint;
pub mod error;
pub mod event;
pub mod interrupt;
pub mod message;
pub mod provider;
pub mod retrieval;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use checkpoint::{Checkpoint, CheckpointStore, SessionLocks};
pub use error::{Error, Result};
pub use event::{DomainEvent, EventBus};
pub use interrupt::{Decision, DecisionKind, EditedAction, Interrupt};
pub use message::{Message, MessageOrigin, Role, transcript};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition};
pub use retrieval::{RetrievedDocument, VectorStore};
pub use session::{Session, StepState};
pub use tool::{Tool, ToolArguments, ToolCall, ToolRegistry, ToolResult};
