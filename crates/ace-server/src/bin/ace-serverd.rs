//! Control-plane HTTP server entrypoint.
//!
//! Mirrors `vpn-identity`'s binary shape: load `.env`, init tracing, load
//! config, build the shared state, build the router, serve with graceful
//! shutdown. On shutdown, every managed container is stopped concurrently
//! rather than left running for the next process to rehydrate.

use std::net::SocketAddr;

use ace_net::GLOBAL_POOL;
use ace_server::{AceConfig, AppState};
use ace_types::labels;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,ace_server=debug".into()))
        .init();

    let config = AceConfig::load()?;
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port).parse()?;

    let state = AppState::build(config)?;
    rehydrate(&state).await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    state.spawn_background_tasks(shutdown_rx);

    let app = ace_server::build_router(state.clone());

    info!(%bind_addr, "ace-serverd listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    shutdown_managed_containers(&state).await;

    Ok(())
}

/// Re-discovers engines from already-running containers carrying the
/// managed label, so a restart doesn't orphan streams the previous process
/// provisioned (spec §7 startup reindex).
async fn rehydrate(state: &AppState) {
    let (key, value) = labels::managed_filter();
    let filter = vec![format!("{key}={value}")];
    let containers = match state.0.driver.list(filter).await {
        Ok(containers) => containers,
        Err(e) => {
            warn!(error = %e, "failed to list containers for rehydration, starting with empty state");
            return;
        }
    };

    let mut found = 0;
    for container in containers {
        let Some(id) = container.id else { continue };
        let Some(container_labels) = container.labels else { continue };

        let name = container
            .names
            .and_then(|n| n.first().cloned())
            .unwrap_or_else(|| id.clone());
        let host_port: u16 = container_labels
            .get(labels::HOST_HTTP_PORT)
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        let mut engine = ace_types::Engine::new(id.clone(), name.clone(), name, host_port);
        engine.labels = container_labels.clone();
        if let Some(vpn) = container_labels.get(labels::VPN_CONTAINER) {
            engine = engine.with_vpn(vpn.clone());
        }
        if container_labels.get(labels::FORWARDED).map(String::as_str) == Some("true") {
            engine.forwarded = true;
        }

        let port_pool = engine.vpn_container.as_deref().unwrap_or(GLOBAL_POOL);
        if host_port != 0 {
            if let Err(e) = state.0.ports.reserve_specific(port_pool, host_port).await {
                warn!(container_id = %id, port = host_port, error = %e, "failed to reserve rehydrated engine's port, a later provision may collide with it");
            }
        }

        state.0.state.rehydrate_engine(engine).await;
        found += 1;
    }
    info!(found, "rehydrated engines from running containers");
}

async fn shutdown_managed_containers(state: &AppState) {
    let ids: Vec<String> = state.0.state.list_engines().await.into_iter().map(|e| e.container_id).collect();
    if ids.is_empty() {
        return;
    }
    info!(count = ids.len(), "stopping managed containers before exit");
    let result = state
        .0
        .driver
        .batch_stop(ids, Some(10), ace_docker::DEFAULT_SHUTDOWN_CONCURRENCY)
        .await;
    info!(
        successful = result.successful.len(),
        failed = result.failed.len(),
        elapsed = ?result.elapsed,
        "managed container shutdown complete"
    );
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
