// notesync-relay: standalone collaboration relay.

use anyhow::Context;
use notesync_relay::{
    app,
    auth::{
        verifier::{probe_backend, BackendProbe, BACKEND_PROBE_TIMEOUT},
        AccessVerifier,
    },
    config::{LogFormat, RelayConfig},
    ws::RelayState,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    init_tracing(&config);

    match probe_backend(&config.backend_url, BACKEND_PROBE_TIMEOUT).await {
        BackendProbe::Reachable(status) => {
            info!(backend_url = %config.backend_url, status, "notes backend reachable");
        }
        BackendProbe::Unhealthy(status) if config.is_production() => {
            anyhow::bail!("notes backend at {} answered {status}", config.backend_url);
        }
        BackendProbe::Unreachable(reason) if config.is_production() => {
            anyhow::bail!("notes backend at {} is unreachable: {reason}", config.backend_url);
        }
        probe => {
            warn!(backend_url = %config.backend_url, ?probe, "notes backend not ready; continuing in development");
        }
    }

    let verifier =
        AccessVerifier::http(&config.backend_url, config.auth_timeout, config.auth_retries)
            .context("failed to build access check client")?;
    let state = RelayState::new(verifier);

    let relay_listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;
    let health_listener = TcpListener::bind(config.health_addr)
        .await
        .with_context(|| format!("failed to bind health listener on {}", config.health_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        health_addr = %config.health_addr,
        environment = ?config.environment,
        "starting relay server"
    );

    app::serve(relay_listener, health_listener, state, config.shutdown_timeout, app::shutdown_signal())
        .await?;

    info!("relay stopped");
    Ok(())
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
