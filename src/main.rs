use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use fleet_dispatch::api;
use fleet_dispatch::config::{Config, LogFormat, StoreBackend};
use fleet_dispatch::engine::{preorder, timeouts};
use fleet_dispatch::error::AppError;
use fleet_dispatch::state::AppState;
use fleet_dispatch::store::{MemoryStore, SqliteStore, Store};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    let filter = EnvFilter::new(config.log_level.clone());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
    }

    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Sqlite => {
            tracing::info!(path = %config.database_path.display(), "using sqlite store");
            Arc::new(SqliteStore::open(&config.database_path)?)
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory store, state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let shared_state = Arc::new(AppState::new(
        store,
        config.dispatch,
        config.event_buffer_size,
    ));
    let app = api::rest::router(shared_state.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // the first tick fires immediately, which picks up offers left over from
    // a previous run before any new traffic arrives
    let timeout_sweeper = tokio::spawn(timeouts::run_timeout_sweeper(
        shared_state.dispatcher.clone(),
        Duration::from_secs(config.timeout_sweep_interval_secs),
        shutdown_rx.clone(),
    ));
    let preorder_sweeper = tokio::spawn(preorder::run_preorder_sweeper(
        shared_state.dispatcher.clone(),
        Duration::from_secs(config.preorder_sweep_interval_secs),
        shutdown_rx,
    ));

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    let _ = shutdown_tx.send(true);
    for handle in [timeout_sweeper, preorder_sweeper] {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "sweeper task failed");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
