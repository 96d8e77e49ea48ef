//! Model provider implementations for agentgate.
//!
//! All providers implement the `agentgate_core::Provider` trait.

pub mod openai_compat;

use agentgate_config::AppConfig;
use agentgate_core::error::ProviderError;

pub use openai_compat::OpenAiCompatProvider;

/// Build the chat provider described by the configuration.
pub fn build_from_config(config: &AppConfig) -> Result<OpenAiCompatProvider, ProviderError> {
    let api_key = config.api_key.clone().unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("No API key configured; requests will likely be rejected");
    }
    OpenAiCompatProvider::new("openai", &config.api_base, api_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgate_core::Provider;

    #[test]
    fn build_from_default_config() {
        let mut config = AppConfig::default();
        config.api_base = "http://localhost:8082/v1/".into();
        let provider = build_from_config(&config).unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.base_url(), "http://localhost:8082/v1");
    }
}
