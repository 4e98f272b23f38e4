//! Persistence service: background archive of finished posts.
//!
//! DESIGN
//! ======
//! The store keeps everything in memory and queues each post as it closes.
//! A background task drains that queue every `PERSIST_FLUSH_MS` and upserts
//! the batch into an [`Archive`]. At startup the archive is loaded back into
//! the memory store so threads and their backlogs survive a restart.
//!
//! Open drafts are never archived; a post is written once, when it finishes.
//! A draft whose author disconnected and never reclaimed it is finished by
//! the upkeep sweep once it has been idle for `ABANDON_GRACE_SECS`, which
//! queues it for the archive like any other finished post.
//!
//! ERROR HANDLING
//! ==============
//! A failed batch is put back at the head of the queue and retried on the
//! next tick. Upserts are idempotent, so a retry after a partial write only
//! rewrites rows that already landed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use frames::PostSnapshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::registry::Registry;
use crate::store::{MemoryStore, Storage};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("archived post {id} is invalid: {reason}")]
    InvalidRow { id: i64, reason: String },
}

/// Durable home of finished posts.
#[async_trait]
pub trait Archive: Send + Sync {
    /// Every archived post, in any order.
    async fn load(&self) -> Result<Vec<PostSnapshot>, PersistError>;

    /// Insert or overwrite `posts`, keyed by post id.
    async fn upsert(&self, posts: &[PostSnapshot]) -> Result<(), PersistError>;
}

/// Load the archive into `store`. Returns the number of posts restored.
///
/// # Errors
///
/// Returns the archive's error if loading fails.
pub async fn restore_archive(store: &MemoryStore, archive: &dyn Archive) -> Result<usize, PersistError> {
    let posts = archive.load().await?;
    let loaded = posts.len();
    let restored = store.restore(posts).await;
    info!(loaded, restored, "archive restored");
    Ok(restored)
}

/// Drain finished posts from `store` and write them to `archive`.
/// Returns how many posts were written.
pub async fn flush_finished(store: &dyn Storage, archive: &dyn Archive) -> usize {
    let batch = store.drain_finished();
    if batch.is_empty() {
        return 0;
    }

    match archive.upsert(&batch).await {
        Ok(()) => batch.len(),
        Err(e) => {
            error!(error = %e, count = batch.len(), "persistence flush failed");
            store.requeue_finished(batch);
            0
        }
    }
}

/// Spawn the background persistence task. Returns a handle for shutdown.
pub fn spawn_persistence_task(store: Arc<dyn Storage>, archive: Arc<dyn Archive>, flush_ms: u64) -> JoinHandle<()> {
    info!(flush_ms, "post persistence flush configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(flush_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            flush_finished(store.as_ref(), archive.as_ref()).await;
        }
    })
}

// =============================================================================
// ABANDONED DRAFTS
// =============================================================================

/// Finish open posts idle for at least `grace` that no connection holds.
/// Returns how many were finished.
pub async fn finish_abandoned(store: &dyn Storage, registry: &Registry, grace: Duration) -> usize {
    let stale = match store.stale_open_posts(grace).await {
        Ok(stale) => stale,
        Err(e) => {
            error!(error = %e, "abandoned draft scan failed");
            return 0;
        }
    };

    let mut finished = 0;
    for id in stale {
        if registry.post_owner(id).await.is_some() {
            continue;
        }
        match store.finish_post(Uuid::nil(), id).await {
            Ok(()) => finished += 1,
            // Finished by its author since the scan.
            Err(e) => debug!(id, error = %e, "abandoned draft not finished"),
        }
    }
    if finished > 0 {
        info!(finished, "abandoned drafts finished");
    }
    finished
}

/// Spawn the abandoned draft sweep. Returns a handle for shutdown.
pub fn spawn_abandon_sweep_task(store: Arc<dyn Storage>, registry: Registry, grace: Duration) -> JoinHandle<()> {
    let period = grace.clamp(Duration::from_millis(1), ABANDON_SWEEP_MAX_PERIOD);
    info!(grace_secs = grace.as_secs(), "abandoned draft sweep configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            finish_abandoned(store.as_ref(), &registry, grace).await;
        }
    })
}

const ABANDON_SWEEP_MAX_PERIOD: Duration = Duration::from_secs(30);

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
