use anyhow::{Context, Result};
use burrow_relay::{router, RelayConfig, RelayState};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("burrow_relay=info")),
        )
        .init();

    let config = RelayConfig::from_env().context("Invalid relay configuration")?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let channel_path = config.channel_path.clone();

    let state = RelayState::new(config);
    let _reaper = state.spawn_reaper();
    let app = router(state);

    info!("Burrow relay on {} (channel path: {})", addr, channel_path);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
