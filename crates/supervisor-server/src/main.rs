mod dispatcher;
mod hub;
mod idempotency_cache;
mod pipeline;
mod policy;
mod reconciler;
mod registry;
mod state;
mod tracker;
mod transport;

use axum::routing::get;
use axum::Router;
use state::AppState;
use std::sync::Arc;
use supervisor_core::SupervisorConfig;
use supervisor_storage::{DurableStore, SqliteStore};
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = SupervisorConfig::from_env();
    let strict_origin = std::env::var("SUPERVISOR_STRICT_ORIGIN")
        .map(|v| v == "true")
        .unwrap_or(false);

    let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::connect(&config.data_dir).await?);
    let app_state = AppState::bootstrap(config.clone(), store, strict_origin).await?;
    let _background = app_state.spawn_background_tasks(&config);

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/agents/ws", get(hub::ws_handler))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "supervisor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
    info!("shutdown signal received");
}
