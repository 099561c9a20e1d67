use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use services::{
    asset_repository::AssetRepository,
    chunk_store::ChunkStore,
    pin_worker::{self, FinishQueue, PinWorker},
    remote::RemoteStore,
    usage::UsageService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        staging_dir = %cfg.staging_dir,
        database_url = %cfg.database_url,
        remote_url = %cfg.remote.base_url,
        sweep_interval_secs = cfg.pin.sweep_interval.as_secs(),
        "Starting pin-gateway"
    );

    // --- Ensure staging directory exists ---
    tokio::fs::create_dir_all(&cfg.staging_dir)
        .await
        .with_context(|| format!("creating staging directory {}", cfg.staging_dir))?;

    // --- Initialize SQLite connection + schema ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let chunks = ChunkStore::new(&cfg.staging_dir);
    let remote = RemoteStore::new(&cfg.remote).context("building remote store client")?;
    let (finish, signals) = FinishQueue::channel(cfg.pin.queue_capacity);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let worker = Arc::new(PinWorker::new(
        AssetRepository::new(db.clone()),
        chunks.clone(),
        remote.clone(),
        UsageService::new(db.clone()),
        cfg.remote.batch_token.clone(),
        cfg.pin.clone(),
    ));
    let worker_handle = worker.spawn(signals, cancel_rx.clone());
    let ticker_handle = pin_worker::spawn_ticker(finish.clone(), cfg.pin.sweep_interval, cancel_rx);

    // --- Build router ---
    let state = state::AppState::new(db, chunks, remote, finish);
    let app: Router = routes::routes::routes()
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Drain the pin worker ---
    tracing::info!("HTTP server stopped, draining pin worker");
    let _ = cancel_tx.send(true);
    if let Err(err) = ticker_handle.await {
        tracing::error!(error = %err, "sweep ticker panicked");
    }
    if let Err(err) = worker_handle.await {
        tracing::error!(error = %err, "pin worker panicked");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
