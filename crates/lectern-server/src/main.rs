//! # lectern-server
//!
//! Offline licensing server for the Lectern reader apps.
//!
//! This binary provides:
//! - **Device registry** with a per-user device limit and revocation
//! - **License issuance** of per-device content keys, wrapped under a KEK
//! - **Encryption workers** that turn source material into protected
//!   artifacts, served through presigned links
//! - **REST API** (axum) for all of the above

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lectern_server::api::{self, AppState};
use lectern_server::config::ServerConfig;
use lectern_server::key_vault::KeyVault;
use lectern_server::storage::{FsObjectStore, ObjectStore};
use lectern_server::Engine;
use lectern_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lectern_server=debug")),
        )
        .init();

    info!("Starting Lectern server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // SQLite (creates the file and runs migrations)
    let database = Database::open_at(&config.database_path)?;

    // Object store (creates the root directory if missing)
    let storage: Arc<dyn ObjectStore> = Arc::new(
        FsObjectStore::new(
            config.storage_path.clone(),
            config.public_storage_url.clone(),
            config.presign_key(),
        )
        .await?,
    );

    let vault = Arc::new(KeyVault::new(config.kek, config.kek_version));
    let engine = Engine::new(&config, database, storage, vault);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = engine.spawn_workers(shutdown_rx);

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let served = tokio::select! {
        result = api::serve(AppState { engine }, config.http_addr) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server failed");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    // -----------------------------------------------------------------------
    // 6. Drain the workers: each finishes the job it holds
    // -----------------------------------------------------------------------
    let _ = shutdown_tx.send(true);
    workers.join().await;

    served
}
