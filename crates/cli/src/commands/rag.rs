//! `agentgate rag`: question answering over the retrieval corpus.

use agentgate_agent::RunFlags;
use agentgate_config::AppConfig;

use super::{chat::require_api_key, console};

pub async fn run(session: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    require_api_key(&config)?;

    let runner = agentgate_gateway::bootstrap::build_rag_runner(&config).await?;
    let session_id = session.unwrap_or_else(console::new_session_id);
    let flags = RunFlags {
        internet_search: false,
        retrieval: true,
    };
    let mut input = console::stdin_lines();
    tracing::debug!(session_id = %session_id, "Starting rag session");

    match &config.retrieval.documents_path {
        Some(path) => println!("  Corpus: {}", path.display()),
        None => println!("  Corpus: none (set retrieval.documents_path)"),
    }
    println!("  Type 'exit' to quit.");
    println!();

    while let Some(line) = console::prompt(&mut input, "Question: ").await? {
        let query = line.trim();
        if query == "exit" {
            break;
        }
        if query.is_empty() {
            continue;
        }
        if let Err(e) =
            console::run_turn(&runner, &session_id, query.to_string(), flags, &mut input).await
        {
            eprintln!("  [error] {e}");
        }
        println!();
    }

    Ok(())
}
