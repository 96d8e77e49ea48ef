//! Configuration loading, validation, and management for agentgate.
//!
//! Loads configuration from `~/.agentgate/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use agentgate_core::DecisionKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.agentgate/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the OpenAI-compatible endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Default chat model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    #[serde(default)]
    pub agent: AgentConfig,

    /// Which tools need human approval
    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_base", &self.api_base)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("approval", &self.approval)
            .field("retrieval", &self.retrieval)
            .field("checkpoint", &self.checkpoint)
            .field("gateway", &self.gateway)
            .field("search", &self.search)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Maximum model calls per request
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Run the planning middleware before every model step
    #[serde(default)]
    pub planning: bool,

    /// Append the current date to the system prompt
    #[serde(default = "default_true")]
    pub append_date: bool,
}

fn default_system_prompt() -> String {
    "You are an assistant that is good at using tools. \
     Use only one tool at a time and never call several tools at once."
        .into()
}
fn default_max_steps() -> u32 {
    25
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_steps: default_max_steps(),
            planning: false,
            append_date: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Tool name → decision types a human may give for it.
    /// Tools not listed run without approval.
    #[serde(default = "default_interrupt_on")]
    pub interrupt_on: BTreeMap<String, Vec<DecisionKind>>,
}

fn default_interrupt_on() -> BTreeMap<String, Vec<DecisionKind>> {
    BTreeMap::from([(
        "eval_tool".to_string(),
        vec![DecisionKind::Approve, DecisionKind::Edit, DecisionKind::Reject],
    )])
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            interrupt_on: default_interrupt_on(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Install the RAG middleware
    #[serde(default)]
    pub enabled: bool,

    /// Rewrite follow-up questions into standalone queries
    #[serde(default = "default_true")]
    pub rewrite_query: bool,

    /// Let a classifier decide between plain LLM and RAG
    #[serde(default = "default_true")]
    pub route: bool,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Offset used for the date injected into RAG prompts
    #[serde(default = "default_utc_offset")]
    pub utc_offset_hours: i32,

    /// JSONL corpus for the in-memory vector store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents_path: Option<PathBuf>,

    /// Embedding model; keyword scoring is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
}

fn default_top_k() -> usize {
    3
}
fn default_utc_offset() -> i32 {
    8
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rewrite_query: true,
            route: true,
            top_k: default_top_k(),
            utc_offset_hours: default_utc_offset(),
            documents_path: None,
            embedding_model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,

    /// Directory (file backend) or database file (sqlite backend).
    /// Defaults to a location under the config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl CheckpointConfig {
    pub fn resolved_path(&self) -> PathBuf {
        match (&self.path, self.backend) {
            (Some(p), _) => p.clone(),
            (None, CheckpointBackend::Sqlite) => AppConfig::config_dir().join("checkpoints.db"),
            (None, _) => AppConfig::config_dir().join("checkpoints"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Origins allowed by CORS. Empty = same-origin only.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tavily_api_key: Option<String>,
}

impl std::fmt::Debug for SearchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchConfig")
            .field("tavily_api_key", &redact(&self.tavily_api_key))
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.agentgate/config.toml).
    ///
    /// Environment variables override the file:
    /// - `AGENTGATE_API_KEY`, then `OPENAI_API_KEY`
    /// - `AGENTGATE_API_BASE`, then `OPENAI_API_BASE`
    /// - `AGENTGATE_MODEL`, then `CHAT_MODEL_NAME`
    /// - `TAVILY_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let first = |keys: &[&str]| keys.iter().find_map(|k| lookup(k).filter(|v| !v.is_empty()));

        if let Some(key) = first(&["AGENTGATE_API_KEY", "OPENAI_API_KEY"]) {
            self.api_key = Some(key);
        }
        if let Some(base) = first(&["AGENTGATE_API_BASE", "OPENAI_API_BASE"]) {
            self.api_base = base;
        }
        if let Some(model) = first(&["AGENTGATE_MODEL", "CHAT_MODEL_NAME"]) {
            self.default_model = model;
        }
        if let Some(key) = first(&["TAVILY_API_KEY"]) {
            self.search.tavily_api_key = Some(key);
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".agentgate")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_steps must be at least 1".into(),
            ));
        }

        if self.retrieval.top_k == 0 {
            return Err(ConfigError::ValidationError(
                "retrieval.top_k must be at least 1".into(),
            ));
        }

        if let Some((tool, _)) = self
            .approval
            .interrupt_on
            .iter()
            .find(|(_, allowed)| allowed.is_empty())
        {
            return Err(ConfigError::ValidationError(format!(
                "approval.interrupt_on.{tool} must allow at least one decision"
            )));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: default_api_base(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentConfig::default(),
            approval: ApprovalConfig::default(),
            retrieval: RetrievalConfig::default(),
            checkpoint: CheckpointConfig::default(),
            gateway: GatewayConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for agentgate_core::Error {
    fn from(e: ConfigError) -> Self {
        agentgate_core::Error::Config {
            message: e.to_string(),
        }
    }
}
