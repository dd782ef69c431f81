use clap::Parser;
use tracing_subscriber::EnvFilter;

use helm_bridge::config::{Args, BridgeConfig};
use helm_bridge::BridgeOrchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match BridgeConfig::from_args(Args::parse()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "fatal configuration error");
            std::process::exit(1);
        }
    };

    tracing::info!(bridge_id = %config.bridge_id, hub_url = %config.hub_url, cloud_url = %config.cloud_url, "starting helm-bridge");

    let orchestrator = BridgeOrchestrator::new(config).await;
    orchestrator.run().await
}
