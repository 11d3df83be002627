use anyhow::{Context, Result};
use flume::unbounded;
use murmur_backend::config::BotConfig;
use murmur_backend::runtime::BackendRuntime;
use murmur_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,murmur_backend=debug")),
        )
        .init();

    let config = BotConfig::load();
    let (event_tx, event_rx) = unbounded();

    tracing::info!(
        "Starting murmur backend (set MURMUR_BACKEND_TOKEN + optional MURMUR_BACKEND_BIND; auth mode via MURMUR_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async move {
        let runtime = BackendRuntime::bootstrap(config, event_tx)
            .await
            .context("failed to bootstrap backend runtime")?;
        serve_backend(runtime, event_rx).await
    })
}
