//! Post allocation and live editing.
//!
//! DESIGN
//! ======
//! Each connection may hold at most one open post. Allocation
//! (`INSERT_THREAD`, `INSERT_POST`, `RECLAIM_POST`) claims the post in the
//! registry and records it on the session; edits apply only to that post.
//! Text is filtered before storage and then capped: a fragment that would
//! overflow the body is truncated to the remaining budget, and an edit that
//! arrives once the budget is exhausted is a protocol violation.
//!
//! Storage fans each accepted edit out to watchers of the thread; nothing
//! is echoed back to the author.
//!
//! ERROR HANDLING
//! ==============
//! Authorization failures and failed reclaims are reported and the session
//! continues. Protocol violations and storage failures close it.

use frames::limits::{MAX_POST_CHARS, MAX_SUBJECT_CHARS, char_count, is_blank, truncate_chars};
use frames::{Command, Event, PostRequest, RECLAIM_FAILED, Splice, ThreadId, ThreadRequest};
use tracing::{info, warn};

use crate::error::{CloseCode, ErrorCode};
use crate::registry::RegistryError;
use crate::services::auth::authorize_claim;
use crate::session::{OwnedPost, Session};
use crate::state::AppState;
use crate::store::{NewPost, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    Denied(String),
    #[error("post could not be reclaimed")]
    ReclaimFailed,
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl ErrorCode for CommandError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "E_PROTOCOL",
            Self::Denied(_) => "E_DENIED",
            Self::ReclaimFailed => RECLAIM_FAILED,
            Self::Storage(e) => e.error_code(),
        }
    }

    fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::Protocol(_) => Some(CloseCode::Protocol),
            Self::Denied(_) | Self::ReclaimFailed => None,
            Self::Storage(e) => e.close_code(),
        }
    }
}

fn protocol(reason: impl Into<String>) -> CommandError {
    CommandError::Protocol(reason.into())
}

/// Handle a post command. Sync commands are not accepted here.
///
/// # Errors
///
/// See [`CommandError`].
pub async fn handle(state: &AppState, session: &mut Session, cmd: Command) -> Result<Vec<Event>, CommandError> {
    match cmd {
        Command::InsertThread(req) => insert_thread(state, session, req).await,
        Command::InsertPost(req) => insert_post(state, session, req).await,
        Command::UpdatePost { frag } => append(state, session, &frag).await,
        Command::Append(c) => append(state, session, &c.to_string()).await,
        Command::Backspace => backspace(state, session).await,
        Command::Splice(splice) => splice_text(state, session, splice).await,
        Command::FinishPost => finish(state, session).await,
        Command::InsertImage { token } => insert_image(state, session, &token).await,
        Command::ReclaimPost { nonce } => reclaim(state, session, &nonce).await,
        Command::Synchronize { .. } | Command::Resync(_) | Command::Desync => {
            Err(protocol("sync command routed to post handler"))
        }
    }
}

// =============================================================================
// ALLOCATION
// =============================================================================

/// Board the session may mutate.
fn writable_board(state: &AppState, session: &Session) -> Result<String, CommandError> {
    let board = match (&session.board, session.is_synced()) {
        (Some(board), true) => board.clone(),
        _ => return Err(protocol("not synchronized")),
    };
    if state.config.read_only {
        return Err(CommandError::Denied("server is read-only".into()));
    }
    if !state.access.can_access(&session.identity, &board) {
        return Err(CommandError::Denied(format!("access denied to board /{board}/")));
    }
    Ok(board)
}

fn ensure_no_open_post(session: &Session) -> Result<(), CommandError> {
    match &session.post {
        Some(post) => Err(protocol(format!("post {} is still open", post.id))),
        None => Ok(()),
    }
}

fn staff_claim(
    state: &AppState,
    session: &Session,
    auth: Option<&str>,
    token: Option<&str>,
) -> Result<Option<String>, CommandError> {
    let Some(claim) = auth else {
        return Ok(None);
    };
    authorize_claim(&session.identity, claim, token, &state.staff)
        .map(|role| Some(role.as_str().to_owned()))
        .map_err(CommandError::Denied)
}

async fn claim(state: &AppState, session: &mut Session, post: OwnedPost) -> Result<Event, CommandError> {
    let event = Event::PostId { id: post.id, op: post.op };
    match state.registry.claim_post(session.conn_id, post.id).await {
        Ok(()) => {}
        Err(RegistryError::PostClaimed(id)) => return Err(protocol(format!("post {id} is claimed elsewhere"))),
        Err(e) => return Err(protocol(e.to_string())),
    }
    info!(conn_id = %session.conn_id, id = post.id, op = post.op, "post: allocated");
    session.post = Some(post);
    Ok(event)
}

async fn insert_thread(state: &AppState, session: &mut Session, req: ThreadRequest) -> Result<Vec<Event>, CommandError> {
    let board = writable_board(state, session)?;
    ensure_no_open_post(session)?;
    let auth = staff_claim(state, session, req.auth.as_deref(), req.session.as_deref())?;

    let subject = req
        .subject
        .map(|s| truncate_chars(&state.filter.apply(&s), MAX_SUBJECT_CHARS).to_owned())
        .filter(|s| !is_blank(s));
    let post = NewPost {
        nonce: req.nonce,
        body: String::new(),
        editing: true,
        name: req.name,
        email: req.email,
        auth,
        subject,
        image: Some(req.image),
    };
    let snapshot = state.store.insert_thread(session.conn_id, &board, post).await?;

    let owned = OwnedPost { id: snapshot.id, op: snapshot.id, chars: 0, has_image: true };
    Ok(vec![claim(state, session, owned).await?])
}

fn target_thread(session: &Session, req: &PostRequest) -> Result<ThreadId, CommandError> {
    req.op
        .or_else(|| session.watch.single_thread())
        .ok_or_else(|| protocol("no target thread"))
}

async fn insert_post(state: &AppState, session: &mut Session, req: PostRequest) -> Result<Vec<Event>, CommandError> {
    let board = writable_board(state, session)?;
    ensure_no_open_post(session)?;
    let op = target_thread(session, &req)?;
    if !state.store.validate_op(&board, op).await? {
        return Err(protocol(format!("thread {op} is not on /{board}/")));
    }
    let auth = staff_claim(state, session, req.auth.as_deref(), req.session.as_deref())?;

    let body = match &req.frag {
        Some(frag) => {
            let filtered = state.filter.apply(frag);
            if char_count(&filtered) > MAX_POST_CHARS {
                return Err(protocol("fragment exceeds post length"));
            }
            filtered
        }
        None => String::new(),
    };
    if is_blank(&body) && req.image.is_none() {
        return Err(protocol("post is empty after filtering"));
    }

    let chars = char_count(&body);
    let has_image = req.image.is_some();
    let post = NewPost {
        nonce: req.nonce,
        body,
        editing: req.open,
        name: req.name,
        email: req.email,
        auth,
        subject: None,
        image: req.image,
    };
    let snapshot = state.store.insert_post(session.conn_id, &board, op, post).await?;

    if !snapshot.editing {
        info!(conn_id = %session.conn_id, id = snapshot.id, op, "post: inserted closed");
        return Ok(vec![Event::PostId { id: snapshot.id, op }]);
    }
    let owned = OwnedPost { id: snapshot.id, op, chars, has_image };
    Ok(vec![claim(state, session, owned).await?])
}

async fn reclaim(state: &AppState, session: &mut Session, nonce: &str) -> Result<Vec<Event>, CommandError> {
    let board = writable_board(state, session)?;
    ensure_no_open_post(session)?;

    let Some(found) = state.store.reclaim_post(&board, nonce).await? else {
        info!(conn_id = %session.conn_id, "post: reclaim found no open post");
        return Err(CommandError::ReclaimFailed);
    };
    if state
        .registry
        .post_owner(found.id)
        .await
        .is_some_and(|owner| owner != session.conn_id)
    {
        warn!(conn_id = %session.conn_id, id = found.id, "post: reclaim of post held by another connection");
        return Err(CommandError::ReclaimFailed);
    }

    let owned = OwnedPost { id: found.id, op: found.op, chars: found.chars, has_image: found.has_image };
    Ok(vec![claim(state, session, owned).await?])
}

// =============================================================================
// EDITING
// =============================================================================

fn open_post(session: &mut Session) -> Result<&mut OwnedPost, CommandError> {
    session.post.as_mut().ok_or_else(|| protocol("no open post"))
}

/// Filter `text` and cut it to what still fits after `kept` code points.
fn fit(state: &AppState, text: &str, kept: usize) -> Result<String, CommandError> {
    let filtered = state.filter.apply(text);
    let len = char_count(&filtered);
    if len > MAX_POST_CHARS {
        return Err(protocol("fragment exceeds post length"));
    }
    let budget = MAX_POST_CHARS.saturating_sub(kept);
    if budget == 0 && len > 0 {
        return Err(protocol("post length limit reached"));
    }
    Ok(truncate_chars(&filtered, budget).to_owned())
}

async fn append(state: &AppState, session: &mut Session, text: &str) -> Result<Vec<Event>, CommandError> {
    writable_board(state, session)?;
    let conn_id = session.conn_id;
    let post = open_post(session)?;

    let text = fit(state, text, post.chars)?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    state.store.append_text(conn_id, post.id, &text).await?;
    post.chars += char_count(&text);
    Ok(Vec::new())
}

async fn backspace(state: &AppState, session: &mut Session) -> Result<Vec<Event>, CommandError> {
    writable_board(state, session)?;
    let conn_id = session.conn_id;
    let post = open_post(session)?;
    if post.chars == 0 {
        return Ok(Vec::new());
    }
    state.store.backspace(conn_id, post.id).await?;
    post.chars -= 1;
    Ok(Vec::new())
}

async fn splice_text(state: &AppState, session: &mut Session, splice: Splice) -> Result<Vec<Event>, CommandError> {
    writable_board(state, session)?;
    let conn_id = session.conn_id;
    let post = open_post(session)?;

    let bounded = splice.clamped(post.chars);
    let kept = post.chars - bounded.len;
    let text = fit(state, &splice.text, kept)?;
    if bounded.len == 0 && text.is_empty() {
        return Ok(Vec::new());
    }
    let applied = state
        .store
        .splice_text(conn_id, post.id, &Splice { text, ..bounded })
        .await?;
    post.chars = post.chars.saturating_sub(applied.len) + char_count(&applied.text);
    Ok(Vec::new())
}

async fn finish(state: &AppState, session: &mut Session) -> Result<Vec<Event>, CommandError> {
    writable_board(state, session)?;
    let conn_id = session.conn_id;
    let post = open_post(session)?;
    let id = post.id;

    state.store.finish_post(conn_id, id).await?;
    state.registry.release_post(conn_id, id).await;
    session.post = None;
    info!(%conn_id, id, "post: finished");
    Ok(Vec::new())
}

async fn insert_image(state: &AppState, session: &mut Session, token: &str) -> Result<Vec<Event>, CommandError> {
    writable_board(state, session)?;
    let conn_id = session.conn_id;
    let post = open_post(session)?;
    if post.has_image {
        return Err(protocol("post already has an image"));
    }
    state.store.insert_image(conn_id, post.id, token).await?;
    post.has_image = true;
    Ok(Vec::new())
}

#[cfg(test)]
#[path = "post_test.rs"]
mod tests;
