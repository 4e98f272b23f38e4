//! Error classification shared by every session-facing service.
//!
//! DESIGN
//! ======
//! Service errors stay as per-module `thiserror` enums. Each one implements
//! [`ErrorCode`] so the websocket layer can turn it into an `ERROR` event
//! without knowing the concrete type, and so it can decide whether the
//! connection survives: errors that return a [`CloseCode`] end the session.

use frames::Event;

/// Websocket close codes used when a session error is fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseCode {
    /// Malformed frame or a command invalid in the session's state.
    Protocol,
    /// Identity or authorization failure during synchronization.
    Policy,
    /// Storage or subscription failure on the server side.
    Internal,
}

impl CloseCode {
    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Protocol => 1002,
            Self::Policy => 1008,
            Self::Internal => 1011,
        }
    }
}

/// Grepable error code plus connection disposition.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    /// `Some` when the session must be closed after reporting the error.
    fn close_code(&self) -> Option<CloseCode> {
        None
    }
}

/// Build the `ERROR` event sent to the client for `err`.
pub fn error_event(err: &(impl ErrorCode + ?Sized)) -> Event {
    Event::Error { code: err.error_code().to_owned(), message: err.to_string() }
}
