//! `agentgate chat`: interactive or single-message chat with approval prompts.

use agentgate_agent::RunFlags;
use agentgate_config::AppConfig;

use super::console;

pub async fn run(
    session: Option<String>,
    message: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    require_api_key(&config)?;

    let runner = agentgate_gateway::bootstrap::build_runner(&config).await?;
    let session_id = session.unwrap_or_else(console::new_session_id);
    let flags = RunFlags::default();
    let mut input = console::stdin_lines();
    tracing::debug!(session_id = %session_id, "Starting chat session");

    if let Some(msg) = message {
        return console::run_turn(&runner, &session_id, msg, flags, &mut input).await;
    }

    println!();
    println!("  agentgate chat");
    println!();
    println!("  Model:     {}", config.default_model);
    println!("  Tools:     {}", runner.tools().names().join(", "));
    println!("  Session:   {session_id}");
    println!();
    println!("  Type your message and press Enter. Type 'exit' to quit.");
    println!();

    while let Some(line) = console::prompt(&mut input, "  You > ").await? {
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query == "exit" || query == "quit" {
            break;
        }
        print!("  Assistant > ");
        if let Err(e) =
            console::run_turn(&runner, &session_id, query.to_string(), flags, &mut input).await
        {
            eprintln!("  [error] {e}");
        }
        println!();
    }

    println!("  Goodbye!");
    Ok(())
}

/// Fail early with setup instructions when no API key is configured.
pub fn require_api_key(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.has_api_key() {
        return Ok(());
    }
    eprintln!();
    eprintln!("  ERROR: No API key configured!");
    eprintln!();
    eprintln!("  Set one of these environment variables:");
    eprintln!("    OPENAI_API_KEY    = 'sk-...'");
    eprintln!("    AGENTGATE_API_KEY = 'sk-...'");
    eprintln!();
    eprintln!("  Or add api_key to your config file:");
    eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
    eprintln!();
    Err("No API key found. See above for setup instructions.".into())
}
