use anyhow::{Context, Result};
use dadbot_backend::config::BotConfig;
use dadbot_backend::runtime::BackendRuntime;
use dadbot_backend::server::serve_backend;
use flume::unbounded;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dadbot_backend=debug")),
        )
        .init();

    let config = BotConfig::load();
    let (event_tx, event_rx) = unbounded();

    tracing::info!(
        "Starting Dad bot backend (set DADBOT_BACKEND_TOKEN + optional DADBOT_BACKEND_BIND; auth mode via DADBOT_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async move {
        let runtime = BackendRuntime::bootstrap(config, event_tx)
            .context("failed to bootstrap backend runtime")?;
        serve_backend(runtime, event_rx).await
    })
}
