//! `agentgate init`: write the default configuration.

use std::path::Path;

use agentgate_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    println!("agentgate setup");
    println!("===============\n");

    if write_default_config(&config_dir)? {
        println!("Created config.toml at: {}", config_dir.join("config.toml").display());
        println!("\nNext steps:");
        println!("   1. Set OPENAI_API_KEY (or api_key in the config)");
        println!("   2. Run `agentgate chat` or `agentgate serve`");
    } else {
        println!(
            "Config already exists at: {}",
            config_dir.join("config.toml").display()
        );
        println!("   Edit it manually or delete it and re-run init.");
    }

    Ok(())
}

/// Write `config.toml` under `dir` unless one exists. Returns whether a file was written.
fn write_default_config(dir: &Path) -> std::io::Result<bool> {
    let path = dir.join("config.toml");
    if path.exists() {
        return Ok(false);
    }
    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, AppConfig::default_toml())?;
    Ok(true)
}
