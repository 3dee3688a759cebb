//! # Order Server
//!
//! The food-ordering backend: customers place orders over HTTP, restaurants
//! update their status, and every open restaurant dashboard is told about
//! both over a WebSocket as soon as the change is committed.
//!
//! ## Core Features:
//! - **Real-time dashboards:** `GET /ws/restaurante/{id}?token=…`, one
//!   session per open dashboard, all receiving the restaurant's events.
//! - **Order API:** creation, status updates, reads and statistics.
//! - **Pluggable storage:** PostgreSQL when `DATABASE_URL` is set, otherwise an
//!   in-memory store optionally seeded with a menu file.
//! - **Graceful shutdown:** Ctrl-C/SIGTERM cancels every session loop and the
//!   notification worker, then stops the listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use lib_common::connections::PostgresStore;
use lib_common::orders::{MemoryStore, OrderStore};
use servers::order_logic::auth::JwtAuth;
use servers::order_logic::config::{ServerConfig, load_config, load_menu_seed};
use servers::order_logic::logger::setup_logging;
use servers::order_logic::router;
use servers::order_logic::state::{AppState, NotifyOptions};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- Phase 0: Crypto Initialization ---
    // Rustls 0.23+ requires an explicit crypto provider before any TLS config is built.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // --- Phase 1: Configuration Loading ---
    dotenvy::dotenv().ok();
    let config = load_config()?;

    // --- Phase 2: Logging Setup ---
    let _log_guard = setup_logging(&config)?;
    tracing::info!(
        port = config.port,
        tls = config.tls.is_some(),
        database = config.database_url.is_some(),
        "order server booting"
    );

    // --- Phase 3: Order Store ---
    let store = open_store(&config).await?;

    // --- Phase 4: Core Infrastructure ---
    let shutdown = CancellationToken::new();
    let (state, dispatch_worker) = AppState::build(
        store,
        JwtAuth::new(&config.jwt_secret),
        NotifyOptions::from(&config),
        shutdown.clone(),
    );
    let registry = Arc::clone(&state.registry);

    // --- Phase 5: Router Construction ---
    let app = router(state, &config.allowed_origins);

    // --- Phase 6: Server Binding and Signal Handling ---
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    match &config.tls {
        Some((cert_path, key_path)) => {
            tracing::info!(cert = %cert_path.display(), "loading TLS certificates");
            let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .map_err(|e| anyhow::anyhow!("TLS Configuration Error: {}", e))?;

            let handle = axum_server::Handle::new();
            let signal_handle = handle.clone();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                tracing::warn!("Shutdown signal received. Closing server gracefully...");
                signal_token.cancel();
                signal_handle.graceful_shutdown(Some(Duration::from_secs(10)));
            });

            tracing::info!("order server live at https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            tracing::info!("order server live at http://{}", addr);

            let signal_token = shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_signal().await;
                    tracing::warn!("Shutdown signal received. Closing server gracefully...");
                    signal_token.cancel();
                })
                .await?;
        }
    }

    // Covers a listener that stopped on its own.
    shutdown.cancel();
    if let Err(e) = dispatch_worker.await {
        tracing::error!(error = %e, "notification worker ended abnormally");
    }
    tracing::info!(
        restaurants = registry.restaurant_count(),
        sessions = registry.total_sessions(),
        "order server stopped"
    );
    Ok(())
}

/// Opens PostgreSQL when configured, otherwise the in-memory store. The menu
/// seed file, if any, is loaded into whichever store is used.
async fn open_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn OrderStore>> {
    let seed = match &config.menu_seed_path {
        Some(path) => load_menu_seed(path)?,
        None => Vec::new(),
    };

    match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url, config.db_max_connections).await?;
            store.ensure_schema().await?;
            for item in &seed {
                store.upsert_menu_item(item).await?;
            }
            tracing::info!(seeded = seed.len(), "using PostgreSQL order store");
            Ok(Arc::new(store))
        }
        None => {
            let store = MemoryStore::with_menu(seed);
            tracing::warn!(menu_items = store.menu_len(), "DATABASE_URL not set, orders are kept in memory");
            Ok(Arc::new(store))
        }
    }
}

/// # Graceful Shutdown Signal Handler
///
/// Completes on Ctrl-C, or on SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
