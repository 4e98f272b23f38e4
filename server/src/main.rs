mod config;
mod db;
mod error;
mod hooks;
mod registry;
mod routes;
mod services;
mod session;
mod state;
mod store;

use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::services::persistence;
use crate::store::{MemoryStore, Storage};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();
    let port = config.port;
    let memory = Arc::new(MemoryStore::new());

    // Archive is optional: without a database the server runs memory-only.
    let _persistence = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url, config.db_max_connections).await?;
            let archive = Arc::new(db::PgArchive::new(pool));
            persistence::restore_archive(&memory, archive.as_ref()).await?;
            Some(persistence::spawn_persistence_task(memory.clone(), archive, config.persist_flush_ms))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; posts are kept in memory only");
            None
        }
    };

    let store: Arc<dyn Storage> = memory;
    let state = state::AppState::new(config, store);

    let _sweep = if state.config.read_only {
        None
    } else {
        let grace = Duration::from_secs(state.config.abandon_grace_secs);
        Some(persistence::spawn_abandon_sweep_task(state.store.clone(), state.registry.clone(), grace))
    };

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;

    tracing::info!(%port, "liveboard listening");
    axum::serve(listener, app).await?;
    Ok(())
}
