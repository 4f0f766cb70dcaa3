mod api;
mod simulator;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use api::ApiClient;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,dadbot=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let origin = std::env::args()
        .nth(1)
        .map(|arg| arg.trim().to_string())
        .filter(|arg| !arg.is_empty())
        .unwrap_or_else(|| dadbot_backend::server::DEFAULT_ORIGIN.to_string());

    let api_client = ApiClient::from_env();
    tracing::info!("Backend API: {}", api_client.base_url());
    if std::env::var("DADBOT_BACKEND_TOKEN")
        .ok()
        .map(|token| token.trim().is_empty())
        .unwrap_or(true)
    {
        tracing::warn!(
            "DADBOT_BACKEND_TOKEN is unset/empty; requests will fail unless backend auth mode is disabled"
        );
    }

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(simulator::run(api_client, origin))
}
