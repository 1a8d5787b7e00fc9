//! Chat relay server.
//!
//! Run with: cargo run -p chat-relay-server
//!
//! Configuration comes from environment variables (see `config.rs`); logging
//! honours `RUST_LOG`.

mod config;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use chat_relay_notify::HttpNotifier;
use chat_relay_session::{LoopbackConnector, SessionManager, storage::FileCredentialStore};
use chat_relay_transport::router;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        sessions_dir = %config.sessions_dir.display(),
        events_url = %config.notifier.events_url,
        messages_url = %config.notifier.messages_url,
        "Starting chat relay"
    );

    let notifier = HttpNotifier::new(config.notifier.clone()).context("failed to build notifier")?;
    let manager = SessionManager::new(
        Arc::new(LoopbackConnector::interactive(config.qr_refresh, config.auto_pair)),
        Arc::new(FileCredentialStore::new(&config.sessions_dir)),
        Arc::new(notifier),
        config.reconnect,
    );

    if config.restore_sessions {
        match manager.restore().await {
            Ok(count) => tracing::info!("Restored {count} session(s)"),
            Err(e) => tracing::error!("Failed to restore sessions: {e}"),
        }
    }

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Server listening on http://{addr}");

    axum::serve(listener, router(manager.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
