use klaxon::config::fetch_config;
use klaxon::{KlaxonError, Pipeline, credentials};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), KlaxonError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    credentials::populate_env_from_keychain();
    let app_config = fetch_config()?;

    let pipeline = Pipeline::new(app_config).await?;
    pipeline.start().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutting down");
    pipeline.stop().await;

    Ok(())
}
