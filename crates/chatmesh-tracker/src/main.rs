use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use chatmesh_store::{Database, DocumentStore};
use chatmesh_tracker::{server, TrackerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chatmesh_tracker=debug")),
        )
        .init();

    info!("Starting chatmesh tracker v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = TrackerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the user/room store
    // -----------------------------------------------------------------------
    let store: Arc<dyn DocumentStore> = Arc::new(Database::open_at(&config.db_path)?);

    // -----------------------------------------------------------------------
    // 4. Bind, spawn the accept loop and both reapers
    // -----------------------------------------------------------------------
    let running = server::start(config, store).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    running.shutdown();

    Ok(())
}
