//! Post-sync hooks.
//!
//! Hooks run after a session is marked synced and may append events to the
//! sync reply. A failing hook is logged and skipped; it never fails the sync.

use async_trait::async_trait;
use frames::limits::{MAX_POST_CHARS, MAX_POST_LINES};
use frames::{Event, ThreadId};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::services::auth::bytes_to_hex;

pub struct SyncContext<'a> {
    pub conn_id: Uuid,
    pub board: &'a str,
    pub live: bool,
    /// The thread being watched, when exactly one is.
    pub op: Option<ThreadId>,
}

#[derive(Debug, thiserror::Error)]
#[error("sync hook failed: {0}")]
pub struct HookError(pub String);

#[async_trait]
pub trait SyncHook: Send + Sync {
    async fn after_sync(&self, ctx: &SyncContext<'_>) -> Result<Vec<Event>, HookError>;
}

/// Settings clients cache locally, keyed by their hash.
#[derive(Serialize)]
struct ClientConfig<'a> {
    boards: &'a [String],
    read_only: bool,
    max_post_chars: usize,
    max_post_lines: usize,
}

/// Sends the hash of the client-visible configuration so clients can
/// detect stale cached settings.
pub struct ConfigHashHook {
    hash: String,
}

impl ConfigHashHook {
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        let visible = ClientConfig {
            boards: &config.boards,
            read_only: config.read_only,
            max_post_chars: MAX_POST_CHARS,
            max_post_lines: MAX_POST_LINES,
        };
        let json = serde_json::to_string(&visible).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        Self { hash: bytes_to_hex(&hasher.finalize()) }
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

#[async_trait]
impl SyncHook for ConfigHashHook {
    async fn after_sync(&self, _ctx: &SyncContext<'_>) -> Result<Vec<Event>, HookError> {
        Ok(vec![Event::ConfigHash { hash: self.hash.clone() }])
    }
}
