//! Built-in tool implementations for agentgate.
//!
//! - `eval_tool`: arithmetic evaluation, always available
//! - `web_search`: Tavily internet search, available when an API key is set

pub mod eval_tool;
pub mod web_search;

use agentgate_core::tool::ToolRegistry;

pub use eval_tool::EvalTool;
pub use web_search::WebSearchTool;

/// Create the default tool registry.
///
/// `web_search` is registered only when `tavily_api_key` is present.
pub fn default_registry(tavily_api_key: Option<&str>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(EvalTool));
    match tavily_api_key.filter(|k| !k.is_empty()) {
        Some(key) => {
            tracing::info!("Search API key configured, registering web_search");
            registry.register(Box::new(WebSearchTool::new(key)));
        }
        None => tracing::debug!("No search API key, web_search disabled"),
    }
    registry
}
