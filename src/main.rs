//! Docsync Server - collaborative document synchronization
//!
//! - Operational transform over a rope for applying op batches
//! - Per-document locks and pending-update queues in an in-process fast store
//! - Sled embedded database as the durable source of truth
//! - Axum HTTP surface for document, project and admin operations

use anyhow::Context;
use axum::http::Method;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docsync_server::config::Config;
use docsync_server::history::{HistoryClient, HttpHistoryClient, NoopHistoryClient};
use docsync_server::storage::SledDocStore;
use docsync_server::{http, DocSync};

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docsync_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Initializing storage at: {}", config.storage_path);
    let storage = SledDocStore::open(config.storage()).context("Failed to open storage")?;
    info!("Storage initialized successfully");

    let history_client: Arc<dyn HistoryClient> = match &config.history_url {
        Some(url) => {
            info!("Sending history to {}", url);
            Arc::new(HttpHistoryClient::new(url.clone()))
        }
        None => {
            info!("HISTORY_URL not set - history entries will be discarded");
            Arc::new(NoopHistoryClient)
        }
    };

    let service = Arc::new(DocSync::new(
        config.service(),
        Arc::new(storage),
        history_client,
    ));
    service.start();

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let app = http::router(service.clone()).layer(cors);

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Docsync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   Workers: {}", config.worker_count);
    info!("   Status: http://{}/status", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Flush everything before exit
    service.shutdown().await;
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received");
}
