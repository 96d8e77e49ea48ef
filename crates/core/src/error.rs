//! Error types for the agentgate domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the top-level [`Error`]
//! is what the step loop and its callers see.

use thiserror::Error;

/// The top-level error type for all agentgate operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model invocation (fatal to the current request) ---
    #[error("Model invocation failed: {0}")]
    ModelInvocation(#[from] ProviderError),

    // --- Middleware chain ---
    #[error("Middleware '{middleware}' failed: {reason}")]
    Middleware { middleware: String, reason: String },

    #[error("Routing classifier returned '{label}', expected LLM or RAG")]
    RoutingAmbiguity { label: String },

    // --- Boundary errors (rejected before the step loop runs) ---
    #[error("Invalid resume: {0}")]
    InvalidResume(String),

    #[error("Conflicting input: {0}")]
    ConflictingInput(String),

    // --- Collaborators ---
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] VectorStoreError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Loop control ---
    #[error("Step limit of {limit} model calls reached")]
    StepLimit { limit: u32 },

    #[error("Request cancelled: client disconnected")]
    Cancelled,

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a middleware failure.
    pub fn middleware(middleware: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Middleware {
            middleware: middleware.into(),
            reason: reason.into(),
        }
    }

    /// True for errors raised at the request boundary, before any state is touched.
    pub fn is_boundary(&self) -> bool {
        matches!(self, Self::InvalidResume(_) | Self::ConflictingInput(_))
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupted checkpoint for session {session_id}: {reason}")]
    Corrupted { session_id: String, reason: String },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Failed to load documents: {0}")]
    LoadFailed(String),
}
