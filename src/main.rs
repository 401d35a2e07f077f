use anyhow::Context;
use clubguard::{config::AppConfig, observability::init_tracing, serve};
use std::env;

const DEFAULT_CONFIG_PATH: &str = "config/clubguard.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let mut config = AppConfig::from_file(&config_path).with_context(|| {
        format!(
            "Failed to load configuration from {} (usage: clubguard [config_file])",
            config_path
        )
    })?;
    init_tracing(&config.logging)?;

    config
        .apply_env_overrides()
        .context("Invalid environment override")?;

    serve(config).await?;
    Ok(())
}
