//! WebSocket handler: one session per connection.
//!
//! DESIGN
//! ======
//! On upgrade, assigns a connection id, registers it and enters a `select!`
//! loop:
//! - Incoming binary frames → decode + dispatch to the sync or post service
//! - Feed items from the store → forward as live updates
//!
//! Services return events or an error; they never touch the socket.
//! `process_inbound_binary` turns that result into an `Outcome`, and the
//! loop owns all outbound concerns.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → staff identity from the `session` cookie, else anonymous
//! 2. Client sends frames → dispatch → `Outcome` (reply or close)
//! 3. Feed items pass through only while their subscription is current; a
//!    subscription the store detached for overflowing closes with 1011
//! 4. Close → release subscription → unregister (frees client id and post)

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use frames::{CodecError, Command, Event, decode_frame, encode_frame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CloseCode, ErrorCode, error_event};
use crate::services::auth::Identity;
use crate::services::{post, sync};
use crate::session::Session;
use crate::state::AppState;
use crate::store::FeedItem;

/// Cookie carrying a staff session token.
pub const SESSION_COOKIE: &str = "session";

/// Close reasons are limited to 123 bytes by the websocket protocol.
const MAX_CLOSE_REASON: usize = 123;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result of processing one inbound message.
#[derive(Debug, PartialEq)]
enum Outcome {
    /// Send these events and keep the session.
    Reply(Vec<Event>),
    /// Send these events, then close with `code`.
    Close { events: Vec<Event>, code: CloseCode, reason: String },
}

/// Transport-level violations found before a command reaches a service.
#[derive(Debug, thiserror::Error)]
enum WsError {
    #[error("text frames are not accepted")]
    TextFrame,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("live feed overflowed; resync required")]
    FeedOverflow,
}

impl ErrorCode for WsError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::TextFrame | Self::Codec(_) => "E_PROTOCOL",
            Self::FeedOverflow => "E_FEED_OVERFLOW",
        }
    }

    fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::TextFrame | Self::Codec(_) => Some(CloseCode::Protocol),
            Self::FeedOverflow => Some(CloseCode::Internal),
        }
    }
}

fn failure(err: &(impl ErrorCode + ?Sized)) -> Outcome {
    let event = error_event(err);
    match err.close_code() {
        Some(code) => Outcome::Close { events: vec![event], code, reason: err.to_string() },
        None => Outcome::Reply(vec![event]),
    }
}

fn settle<E: ErrorCode>(result: Result<Vec<Event>, E>) -> Outcome {
    match result {
        Ok(events) => Outcome::Reply(events),
        Err(e) => failure(&e),
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, jar: CookieJar, ws: WebSocketUpgrade) -> Response {
    let identity = jar
        .get(SESSION_COOKIE)
        .map(Cookie::value)
        .and_then(|token| state.staff.identify(token))
        .unwrap_or(Identity::Anonymous);

    ws.on_upgrade(move |socket| run_ws(socket, state, identity))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, identity: Identity) {
    let conn_id = Uuid::new_v4();

    // Per-connection channel for live updates from the store.
    let (feed_tx, mut feed_rx) = mpsc::channel::<FeedItem>(state.config.feed_capacity);

    state.registry.register(conn_id).await;
    info!(%conn_id, role = identity.role().map(|r| r.as_str()), "ws: client connected");
    let mut session = Session::new(conn_id, identity, feed_tx);

    let reason = loop {
        let outcome = tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break "transport closed" };
                match msg {
                    Message::Binary(bytes) => process_inbound_binary(&state, &mut session, &bytes).await,
                    Message::Text(_) => {
                        warn!(%conn_id, "ws: text frame rejected");
                        failure(&WsError::TextFrame)
                    }
                    Message::Close(_) => break "client closed",
                    Message::Ping(_) | Message::Pong(_) => continue,
                }
            }
            Some(item) = feed_rx.recv() => process_feed_item(&state, &session, item),
        };
        match outcome {
            Outcome::Reply(events) => {
                if send_events(&mut socket, conn_id, &events).await.is_err() {
                    break "send failed";
                }
            }
            Outcome::Close { events, code, reason } => {
                let _ = send_events(&mut socket, conn_id, &events).await;
                close(&mut socket, conn_id, code, &reason).await;
                break "closed by server";
            }
        }
    };

    session.release_subscription();
    state.registry.unregister(conn_id).await;
    let remaining = state.registry.connection_count().await;
    info!(%conn_id, reason, remaining, "ws: client disconnected");
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Decode and process one inbound binary frame.
///
/// This keeps the websocket transport concerns separate from command
/// handling so tests can drive a session without a socket.
async fn process_inbound_binary(state: &AppState, session: &mut Session, bytes: &[u8]) -> Outcome {
    let cmd = match decode_frame(bytes).and_then(|frame| Command::from_frame(&frame)) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!(conn_id = %session.conn_id, error = %e, "ws: invalid inbound frame");
            return failure(&WsError::from(e));
        }
    };
    debug!(conn_id = %session.conn_id, code = ?cmd.code(), "ws: recv command");

    let outcome = match cmd {
        Command::Synchronize { id, sync: req } => settle(sync::synchronize(state, session, &id, req).await),
        Command::Resync(req) => settle(sync::resync(state, session, req).await),
        Command::Desync => {
            sync::desync(session);
            Outcome::Reply(Vec::new())
        }
        other => settle(post::handle(state, session, other).await),
    };

    if let Outcome::Close { code, reason, .. } = &outcome {
        warn!(conn_id = %session.conn_id, code = code.as_u16(), reason = %reason, "ws: closing session");
    }
    outcome
}

/// Turn one live feed item into what this connection should be sent.
fn process_feed_item(state: &AppState, session: &Session, item: FeedItem) -> Outcome {
    if state.store.is_lagged(item.subscription) && session.subscription_id() == Some(item.subscription) {
        warn!(conn_id = %session.conn_id, subscription = item.subscription, "ws: feed overflowed, closing");
        return failure(&WsError::FeedOverflow);
    }
    if !session.accepts(&item) {
        return Outcome::Reply(Vec::new());
    }
    Outcome::Reply(vec![Event::Update { thread: item.thread, update: item.update }])
}

// =============================================================================
// OUTBOUND
// =============================================================================

async fn send_events(socket: &mut WebSocket, conn_id: Uuid, events: &[Event]) -> Result<(), axum::Error> {
    for event in events {
        send_event(socket, conn_id, event).await?;
    }
    Ok(())
}

async fn send_event(socket: &mut WebSocket, conn_id: Uuid, event: &Event) -> Result<(), axum::Error> {
    let frame = event.to_frame();
    match event {
        Event::Error { code, message } => warn!(%conn_id, code = %code, message = %message, "ws: send error"),
        Event::Update { .. } => debug!(%conn_id, code = ?frame.code, thread = ?frame.thread, "ws: send update"),
        _ => info!(%conn_id, code = ?frame.code, "ws: send frame"),
    }
    socket.send(Message::Binary(encode_frame(&frame).into())).await
}

async fn close(socket: &mut WebSocket, conn_id: Uuid, code: CloseCode, reason: &str) {
    let frame = CloseFrame { code: code.as_u16(), reason: close_reason(reason).to_owned().into() };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(%conn_id, error = %e, "ws: close frame not delivered");
    }
}

fn close_reason(reason: &str) -> &str {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
