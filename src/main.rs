use std::sync::Arc;

use anyhow::{Context, Result};
use solace::agent::{AgentSettings, AutonomousAgent};
use solace::config::CompanionConfig;
use solace::database::CompanionDatabase;
use solace::llm_client::LlmClient;
use solace::server::serve_api;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,solace=debug")),
        )
        .init();

    let config = CompanionConfig::load();

    let database = Arc::new(
        CompanionDatabase::new(&config.database_path)
            .with_context(|| format!("failed to open database at {}", config.database_path))?,
    );
    let backend = Arc::new(LlmClient::new(
        config.llm_api_url.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
    ));
    tracing::info!("Model backend: {} ({})", config.llm_api_url, config.llm_model);

    let agent = Arc::new(AutonomousAgent::new(
        AgentSettings::from_config(&config),
        backend,
        database.clone(),
        Some(database),
    ));
    agent.register_default_tasks().await;

    let loop_handle = tokio::spawn(agent.clone().run_loop());

    tracing::info!(
        "Starting control API (set SOLACE_API_TOKEN + optional SOLACE_API_BIND; auth mode via SOLACE_API_AUTH_MODE)"
    );

    tokio::select! {
        result = serve_api(&config, agent.clone()) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    agent.stop(true).await;
    let _ = loop_handle.await;
    Ok(())
}
