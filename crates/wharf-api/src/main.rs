mod auth;
mod config;
mod dispatcher;
mod dto;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use wharf_env::ServerCollection;
use wharf_env::definition::{self, BuildContext};
use wharf_env::events::{EventBus, EventKind};

use crate::config::AppConfig;
use crate::dispatcher::PowerDispatcher;
use crate::routes::api_router;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env().expect("invalid configuration");

    // Servers
    let events = EventBus::new();
    spawn_event_log(&events);

    let defs = definition::load_definitions(&config.servers_file)
        .await
        .expect("failed to load server definitions");
    let ctx = BuildContext {
        data_dir: config.data_dir.clone(),
        log_dir: config.log_dir.clone(),
        poll_interval: config.poll_interval,
        events,
    };
    let servers = definition::build_collection(defs, &ctx).expect("failed to build servers");
    tracing::info!(count = servers.len(), "servers loaded");

    reconcile(&servers).await;

    let state = AppState {
        servers: servers.clone(),
        config: Arc::new(config.clone()),
        dispatcher: PowerDispatcher::new(),
    };
    let dispatcher = state.dispatcher.clone();

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind listener");

    tracing::info!(addr = %config.listen_addr, "starting control plane API");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    dispatcher.shutdown(config.shutdown_grace).await;
    for server in servers.all() {
        if let Err(e) = server.environment().disable_resource_polling().await {
            tracing::warn!(server = %server.id(), error = %e, "failed to stop resource polling");
        }
    }
    tracing::info!("shutdown complete");
}

/// Create missing environments and re-attach to running ones. Failures are
/// scoped to the server.
async fn reconcile(servers: &ServerCollection) {
    for server in servers.all() {
        if let Err(e) = server.reconcile().await {
            tracing::error!(server = %server.id(), error = %e, "failed to reconcile server");
        }
    }
}

fn spawn_event_log(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match &event.kind {
                    EventKind::ConsoleOutput(line) => {
                        tracing::trace!(server = %event.server, line = %line, "console")
                    }
                    kind => tracing::trace!(server = %event.server, event = ?kind, "server event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::trace!(skipped, "event log lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
