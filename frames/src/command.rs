//! Client-to-server commands.
//!
//! Every inbound frame is converted into a [`Command`] before it reaches the
//! session logic. Conversion rejects unknown fields, wrong types, invalid code
//! points and the request-level rules (`frag`/`image` presence, blank
//! fragments, empty nonces) so downstream code only sees well-formed input.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::diff::{Edit, Splice};
use crate::limits::{MAX_NAME_CHARS, MAX_SUBJECT_CHARS, char_count, is_blank};
use crate::{Code, CodecError, Frame, ThreadId};

// =============================================================================
// TYPES
// =============================================================================

/// Board and watch-set requested by `SYNCHRONIZE` / `RESYNC`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncRequest {
    pub board: String,
    /// Requested threads mapped to the number of updates the client has seen.
    pub syncs: BTreeMap<ThreadId, u64>,
    /// Whole-board mode. Overrides `syncs`.
    pub live: bool,
}

/// Allocation request for a new thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadRequest {
    pub image: String,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Staff role the author wants displayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    /// Staff session token backing `auth`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// Allocation request for a reply post.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Target thread. Required unless the session watches exactly one thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<ThreadId>,
    #[serde(default = "default_open")]
    pub open: bool,
}

fn default_open() -> bool {
    true
}

/// A validated client-to-server message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Synchronize { id: String, sync: SyncRequest },
    Resync(SyncRequest),
    Desync,
    InsertThread(ThreadRequest),
    InsertPost(PostRequest),
    UpdatePost { frag: String },
    Append(char),
    Backspace,
    Splice(Splice),
    FinishPost,
    InsertImage { token: String },
    ReclaimPost { nonce: String },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SyncWire {
    #[serde(default)]
    id: Option<String>,
    board: String,
    #[serde(default)]
    syncs: BTreeMap<String, u64>,
    #[serde(default)]
    live: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Empty {}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FragWire {
    frag: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AppendWire {
    char: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SpliceWire {
    start: usize,
    len: usize,
    text: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TokenWire {
    token: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NonceWire {
    nonce: String,
}

// =============================================================================
// VALIDATION
// =============================================================================

impl ThreadRequest {
    /// Check request-level rules that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a reason string describing the first violated rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.image.is_empty() {
            return Err("thread requires an image".into());
        }
        check_nonce(&self.nonce)?;
        check_poster(self.name.as_deref(), self.email.as_deref())?;
        if self.subject.as_deref().is_some_and(|s| char_count(s) > MAX_SUBJECT_CHARS) {
            return Err("subject too long".into());
        }
        Ok(())
    }
}

impl PostRequest {
    /// Minimal request carrying only a nonce.
    #[must_use]
    pub fn new(nonce: impl Into<String>) -> Self {
        Self {
            frag: None,
            image: None,
            nonce: nonce.into(),
            name: None,
            email: None,
            auth: None,
            session: None,
            op: None,
            open: true,
        }
    }

    /// Check request-level rules that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a reason string describing the first violated rule.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.frag, &self.image) {
            (None, None) => return Err("post requires a fragment or an image".into()),
            (Some(frag), _) if is_blank(frag) => {
                return Err("fragment must contain non-whitespace".into());
            }
            (_, Some(image)) if image.is_empty() => return Err("empty image token".into()),
            _ => {}
        }
        check_nonce(&self.nonce)?;
        check_poster(self.name.as_deref(), self.email.as_deref())
    }
}

fn check_nonce(nonce: &str) -> Result<(), String> {
    if nonce.is_empty() {
        return Err("empty nonce".into());
    }
    Ok(())
}

fn check_poster(name: Option<&str>, email: Option<&str>) -> Result<(), String> {
    if name.is_some_and(|n| char_count(n) > MAX_NAME_CHARS) {
        return Err("name too long".into());
    }
    if email.is_some_and(|e| char_count(e) > MAX_NAME_CHARS) {
        return Err("email too long".into());
    }
    Ok(())
}

// =============================================================================
// CONVERSION
// =============================================================================

impl Command {
    /// Wire code for this command.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            Self::Synchronize { .. } => Code::Synchronize,
            Self::Resync(_) => Code::Resync,
            Self::Desync => Code::Desync,
            Self::InsertThread(_) => Code::InsertThread,
            Self::InsertPost(_) => Code::InsertPost,
            Self::UpdatePost { .. } => Code::UpdatePost,
            Self::Append(_) => Code::Append,
            Self::Backspace => Code::Backspace,
            Self::Splice(_) => Code::Splice,
            Self::FinishPost => Code::FinishPost,
            Self::InsertImage { .. } => Code::InsertImage,
            Self::ReclaimPost { .. } => Code::ReclaimPost,
        }
    }

    /// Encode into a frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let data = match self {
            Self::Synchronize { id, sync } => {
                let mut data = sync_to_json(sync);
                data["id"] = Value::String(id.clone());
                data
            }
            Self::Resync(sync) => sync_to_json(sync),
            Self::Desync | Self::Backspace | Self::FinishPost => Value::Object(Map::new()),
            Self::InsertThread(req) => serde_json::to_value(req).unwrap_or_default(),
            Self::InsertPost(req) => serde_json::to_value(req).unwrap_or_default(),
            Self::UpdatePost { frag } => json!({ "frag": frag }),
            Self::Append(c) => json!({ "char": u32::from(*c) }),
            Self::Splice(splice) => serde_json::to_value(splice).unwrap_or_default(),
            Self::InsertImage { token } => json!({ "token": token }),
            Self::ReclaimPost { nonce } => json!({ "nonce": nonce }),
        };
        Frame::new(self.code(), data)
    }

    /// Decode and validate a frame received from a client.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unexpected`] for server-to-client codes and
    /// [`CodecError::Malformed`] when the payload does not fit the code.
    pub fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        let code = frame.code;
        match code {
            Code::Synchronize => {
                let wire: SyncWire = payload(frame)?;
                let id = wire
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| CodecError::malformed(code, "missing client id"))?;
                Ok(Self::Synchronize { id, sync: sync_from_wire(code, wire)? })
            }
            Code::Resync => {
                let wire: SyncWire = payload(frame)?;
                if wire.id.is_some() {
                    return Err(CodecError::malformed(code, "unexpected client id"));
                }
                Ok(Self::Resync(sync_from_wire(code, wire)?))
            }
            Code::Desync => payload::<Empty>(frame).map(|_| Self::Desync),
            Code::InsertThread => {
                let req: ThreadRequest = payload(frame)?;
                req.validate().map_err(|e| CodecError::malformed(code, e))?;
                Ok(Self::InsertThread(req))
            }
            Code::InsertPost => {
                let req: PostRequest = payload(frame)?;
                req.validate().map_err(|e| CodecError::malformed(code, e))?;
                Ok(Self::InsertPost(req))
            }
            Code::UpdatePost => {
                let wire: FragWire = payload(frame)?;
                Ok(Self::UpdatePost { frag: wire.frag })
            }
            Code::Append => {
                let wire: AppendWire = payload(frame)?;
                char::from_u32(wire.char)
                    .map(Self::Append)
                    .ok_or_else(|| CodecError::malformed(code, "invalid code point"))
            }
            Code::Backspace => payload::<Empty>(frame).map(|_| Self::Backspace),
            Code::Splice => {
                let wire: SpliceWire = payload(frame)?;
                Ok(Self::Splice(Splice { start: wire.start, len: wire.len, text: wire.text }))
            }
            Code::FinishPost => payload::<Empty>(frame).map(|_| Self::FinishPost),
            Code::InsertImage => {
                let wire: TokenWire = payload(frame)?;
                if wire.token.is_empty() {
                    return Err(CodecError::malformed(code, "empty image token"));
                }
                Ok(Self::InsertImage { token: wire.token })
            }
            Code::ReclaimPost => {
                let wire: NonceWire = payload(frame)?;
                check_nonce(&wire.nonce).map_err(|e| CodecError::malformed(code, e))?;
                Ok(Self::ReclaimPost { nonce: wire.nonce })
            }
            Code::Error | Code::PostId | Code::Backlog | Code::ConfigHash => {
                Err(CodecError::Unexpected(code))
            }
        }
    }
}

impl From<Edit> for Command {
    fn from(edit: Edit) -> Self {
        match edit {
            Edit::Append(c) => Self::Append(c),
            Edit::Backspace => Self::Backspace,
            Edit::Splice(splice) => Self::Splice(splice),
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Deserialize a payload, treating `null` as an empty object.
pub(crate) fn payload<T: DeserializeOwned>(frame: &Frame) -> Result<T, CodecError> {
    let value = if frame.data.is_null() {
        Value::Object(Map::new())
    } else {
        frame.data.clone()
    };
    serde_json::from_value(value).map_err(|e| CodecError::malformed(frame.code, e.to_string()))
}

fn sync_from_wire(code: Code, wire: SyncWire) -> Result<SyncRequest, CodecError> {
    if wire.board.is_empty() {
        return Err(CodecError::malformed(code, "empty board"));
    }
    let mut syncs = BTreeMap::new();
    for (key, seen) in wire.syncs {
        let thread: ThreadId = key
            .parse()
            .map_err(|_| CodecError::malformed(code, format!("invalid thread id: {key}")))?;
        syncs.insert(thread, seen);
    }
    Ok(SyncRequest { board: wire.board, syncs, live: wire.live })
}

fn sync_to_json(sync: &SyncRequest) -> Value {
    let syncs: Map<String, Value> = sync
        .syncs
        .iter()
        .map(|(thread, seen)| (thread.to_string(), Value::from(*seen)))
        .collect();
    json!({ "board": sync.board, "syncs": syncs, "live": sync.live })
}

#[cfg(test)]
#[path = "command_test.rs"]
mod tests;
