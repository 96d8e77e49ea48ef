//! `agentgate serve`: start the HTTP gateway.

use agentgate_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("agentgate gateway");
    println!("   Listening:  {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:      {}", config.default_model);
    println!("   Checkpoint: {:?}", config.checkpoint.backend);
    println!("   Retrieval:  {}", config.retrieval.enabled);

    agentgate_gateway::start(config).await?;

    Ok(())
}
