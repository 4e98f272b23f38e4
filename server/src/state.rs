//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the post store, the connection registry and everything derived
//! from configuration at startup: text filter, staff directory, board
//! access lists and post-sync hooks. Per-connection state lives in the
//! websocket task's `Session`, never here.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::hooks::{ConfigHashHook, SyncHook};
use crate::registry::Registry;
use crate::services::auth::{BoardAccess, StaffDirectory};
use crate::services::filter::TextFilter;
use crate::store::Storage;

/// Process-wide state. Cheap to clone: every field is an `Arc` or a handle.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn Storage>,
    pub registry: Registry,
    pub filter: Arc<TextFilter>,
    pub staff: Arc<StaffDirectory>,
    pub access: Arc<BoardAccess>,
    pub hooks: Arc<Vec<Arc<dyn SyncHook>>>,
}

impl AppState {
    #[must_use]
    pub fn new(config: ServerConfig, store: Arc<dyn Storage>) -> Self {
        let filter = TextFilter::new(&config.excluded_chars, &config.word_filters);
        let staff = StaffDirectory::parse(&config.staff_sessions);
        let access = BoardAccess::new(&config.boards, &config.staff_boards);
        let config_hash = ConfigHashHook::new(&config);
        if staff.is_empty() && !config.staff_boards.is_empty() {
            warn!(staff_boards = ?config.staff_boards, "staff boards configured without staff sessions");
        }
        info!(
            boards = ?config.boards,
            staff = staff.len(),
            read_only = config.read_only,
            config_hash = config_hash.hash(),
            "app state configured"
        );
        let hooks: Vec<Arc<dyn SyncHook>> = vec![Arc::new(config_hash)];
        Self {
            config: Arc::new(config),
            store,
            registry: Registry::new(),
            filter: Arc::new(filter),
            staff: Arc::new(staff),
            access: Arc::new(access),
            hooks: Arc::new(hooks),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
