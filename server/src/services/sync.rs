//! Session synchronization: `SYNCHRONIZE`, `RESYNC` and `DESYNC`.
//!
//! DESIGN
//! ======
//! A sync replaces the session's watch-set wholesale. The old subscription
//! is released first, requested threads are validated against the board,
//! the survivors are subscribed, and only then is the backlog fetched, so
//! no update can fall between backlog and live feed. Updates that land in
//! both are delivered twice; clients de-duplicate by backlog position.
//!
//! The reply is the backlog followed by `Synced`, then whatever the
//! post-sync hooks add.
//!
//! ERROR HANDLING
//! ==============
//! Identity and board-access failures are fatal to the connection. Invalid
//! threads are dropped silently unless all of them are invalid or more than
//! the configured threshold were dropped; then the sync fails and the
//! connection closes. On any failure the session is left `Unsynced`.

use std::collections::{BTreeMap, BTreeSet};

use frames::{BacklogEntry, Event, SyncRequest, ThreadId};
use futures::future::join_all;
use tracing::{info, warn};

use crate::error::{CloseCode, ErrorCode};
use crate::hooks::SyncContext;
use crate::registry::RegistryError;
use crate::session::{Session, SyncState};
use crate::state::AppState;
use crate::store::{StoreError, WatchSet};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{0}")]
    Protocol(String),
    #[error("access denied to board /{0}/")]
    Denied(String),
    #[error(transparent)]
    Identity(#[from] RegistryError),
    #[error("couldn't sync to board: {dropped} of {requested} threads invalid")]
    InvalidThreads { requested: usize, dropped: usize },
    #[error("couldn't sync to board: no thread could be subscribed")]
    SubscribeFailed,
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "E_PROTOCOL",
            Self::Denied(_) => "E_DENIED",
            Self::Identity(_) => "E_DUPLICATE_ID",
            Self::InvalidThreads { .. } | Self::SubscribeFailed => "E_SYNC_FAILED",
            Self::Storage(_) => "E_STORAGE",
        }
    }

    fn close_code(&self) -> Option<CloseCode> {
        Some(match self {
            Self::Protocol(_) => CloseCode::Protocol,
            Self::Denied(_) | Self::Identity(_) | Self::InvalidThreads { .. } => CloseCode::Policy,
            Self::SubscribeFailed | Self::Storage(_) => CloseCode::Internal,
        })
    }
}

/// First sync of a connection; binds the client id to it.
///
/// A second `SYNCHRONIZE` carrying the same id behaves as `RESYNC`.
///
/// # Errors
///
/// See [`SyncError`]. Every variant closes the connection.
pub async fn synchronize(
    state: &AppState,
    session: &mut Session,
    client_id: &str,
    req: SyncRequest,
) -> Result<Vec<Event>, SyncError> {
    match session.client_id.as_deref() {
        Some(bound) if bound != client_id => {
            return Err(SyncError::Protocol("client id cannot change on a connection".into()));
        }
        Some(_) => {}
        None => {
            state.registry.claim_client_id(session.conn_id, client_id).await?;
            session.client_id = Some(client_id.to_owned());
        }
    }
    sync(state, session, req).await
}

/// Change board or watch-set on an already identified connection.
///
/// # Errors
///
/// See [`SyncError`]. Every variant closes the connection.
pub async fn resync(state: &AppState, session: &mut Session, req: SyncRequest) -> Result<Vec<Event>, SyncError> {
    if session.client_id.is_none() {
        return Err(SyncError::Protocol("resync before synchronize".into()));
    }
    sync(state, session, req).await
}

/// Stop receiving updates. The open post, if any, stays owned.
pub fn desync(session: &mut Session) {
    session.desync();
    info!(conn_id = %session.conn_id, "sync: desynced");
}

async fn sync(state: &AppState, session: &mut Session, req: SyncRequest) -> Result<Vec<Event>, SyncError> {
    session.desync();
    session.state = SyncState::Syncing;

    let backlog = match attach(state, session, &req).await {
        Ok(backlog) => backlog,
        Err(e) => {
            session.desync();
            return Err(e);
        }
    };

    session.board = Some(req.board.clone());
    session.state = SyncState::Synced;
    info!(
        conn_id = %session.conn_id,
        board = %req.board,
        live = req.live,
        backlog = backlog.len(),
        "sync: synced"
    );

    let mut events = vec![Event::Backlog(backlog), Event::Synced];
    let ctx = SyncContext {
        conn_id: session.conn_id,
        board: &req.board,
        live: req.live,
        op: session.watch.single_thread(),
    };
    for hook in state.hooks.iter() {
        match hook.after_sync(&ctx).await {
            Ok(extra) => events.extend(extra),
            Err(e) => warn!(conn_id = %session.conn_id, error = %e, "sync: hook failed"),
        }
    }
    Ok(events)
}

/// Validate, subscribe and fetch the backlog. Leaves the subscription and
/// watch-set on the session.
async fn attach(
    state: &AppState,
    session: &mut Session,
    req: &SyncRequest,
) -> Result<Vec<BacklogEntry>, SyncError> {
    if !state.access.can_access(&session.identity, &req.board) {
        return Err(SyncError::Denied(req.board.clone()));
    }

    let watch = if req.live {
        WatchSet::Live
    } else {
        WatchSet::Threads(valid_threads(state, &req.board, &req.syncs).await?)
    };

    let subscription = state.store.subscribe(&req.board, &watch, session.feed()).await?;
    let watch = match watch {
        WatchSet::Threads(requested) => {
            if !subscription.failed().is_empty() {
                warn!(conn_id = %session.conn_id, failed = ?subscription.failed(), "sync: threads dropped at subscribe");
            }
            if !requested.is_empty() && subscription.threads().is_empty() {
                return Err(SyncError::SubscribeFailed);
            }
            WatchSet::Threads(subscription.threads().iter().copied().collect())
        }
        WatchSet::Live => WatchSet::Live,
    };

    let seen: BTreeMap<ThreadId, u64> = match &watch {
        WatchSet::Threads(threads) => threads
            .iter()
            .map(|t| (*t, req.syncs.get(t).copied().unwrap_or(0)))
            .collect(),
        WatchSet::Live => BTreeMap::new(),
    };
    let backlog = state.store.fetch_backlog(&req.board, &seen).await?;

    session.attach(subscription);
    session.watch = watch;
    Ok(backlog)
}

async fn valid_threads(
    state: &AppState,
    board: &str,
    syncs: &BTreeMap<ThreadId, u64>,
) -> Result<BTreeSet<ThreadId>, SyncError> {
    let checks = join_all(syncs.keys().map(|&thread| async move {
        state.store.validate_op(board, thread).await.map(|ok| (thread, ok))
    }))
    .await;

    let mut valid = BTreeSet::new();
    for check in checks {
        let (thread, ok) = check?;
        if ok {
            valid.insert(thread);
        }
    }

    let requested = syncs.len();
    let dropped = requested - valid.len();
    if requested > 0 && (valid.is_empty() || dropped > state.config.max_invalid_threads) {
        return Err(SyncError::InvalidThreads { requested, dropped });
    }
    Ok(valid)
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
