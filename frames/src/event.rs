//! Server-to-client events.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::command::payload;
use crate::diff::Splice;
use crate::{Code, CodecError, Frame, PostId, ThreadId};

/// Full state of a post at the moment it was created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSnapshot {
    pub id: PostId,
    pub op: ThreadId,
    pub board: String,
    /// Unix seconds.
    pub time: i64,
    pub body: String,
    pub editing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// One mutation of a thread, as fanned out to watchers and kept in backlogs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostUpdate {
    InsertThread(PostSnapshot),
    InsertPost(PostSnapshot),
    Append { id: PostId, text: String },
    Backspace { id: PostId },
    Splice { id: PostId, start: usize, len: usize, text: String },
    Finish { id: PostId },
    InsertImage { id: PostId, token: String },
}

impl PostUpdate {
    /// Wire code used when this update is sent live.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            Self::InsertThread(_) => Code::InsertThread,
            Self::InsertPost(_) => Code::InsertPost,
            Self::Append { .. } => Code::Append,
            Self::Backspace { .. } => Code::Backspace,
            Self::Splice { .. } => Code::Splice,
            Self::Finish { .. } => Code::FinishPost,
            Self::InsertImage { .. } => Code::InsertImage,
        }
    }

    /// Post the update targets.
    #[must_use]
    pub fn post_id(&self) -> PostId {
        match self {
            Self::InsertThread(post) | Self::InsertPost(post) => post.id,
            Self::Append { id, .. }
            | Self::Backspace { id }
            | Self::Splice { id, .. }
            | Self::Finish { id }
            | Self::InsertImage { id, .. } => *id,
        }
    }

    #[must_use]
    pub fn splice(id: PostId, splice: Splice) -> Self {
        Self::Splice { id, start: splice.start, len: splice.len, text: splice.text }
    }

    /// Apply a mutation to a cached copy of the post it targets.
    ///
    /// Insertions replace the cache entry and are not handled here.
    pub fn apply(&self, post: &mut PostSnapshot) {
        match self {
            Self::InsertThread(_) | Self::InsertPost(_) => {}
            Self::Append { text, .. } => post.body.push_str(text),
            Self::Backspace { .. } => {
                post.body.pop();
            }
            Self::Splice { start, len, text, .. } => {
                let splice = Splice { start: *start, len: *len, text: text.clone() };
                post.body = splice.apply(&post.body);
            }
            Self::Finish { .. } => post.editing = false,
            Self::InsertImage { token, .. } => post.image = Some(token.clone()),
        }
    }
}

/// A historical update delivered during sync. `payload` is the JSON
/// serialization of a [`PostUpdate`], passed through untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogEntry {
    pub thread: ThreadId,
    pub payload: String,
}

impl BacklogEntry {
    /// Decode the stored update.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the payload is not a serialized update.
    pub fn update(&self) -> Result<PostUpdate, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// `ERROR` code reported when `RECLAIM_POST` finds no post to resume.
pub const RECLAIM_FAILED: &str = "E_RECLAIM_FAILED";

/// A server-to-client message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Sync acknowledged. Sent after the backlog.
    Synced,
    Backlog(Vec<BacklogEntry>),
    /// Identifier assigned to the connection's newly allocated post.
    PostId { id: PostId, op: ThreadId },
    Update { thread: ThreadId, update: PostUpdate },
    ConfigHash { hash: String },
    Error { code: String, message: String },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BacklogWire {
    entries: Vec<BacklogEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PostIdWire {
    id: PostId,
    op: ThreadId,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HashWire {
    hash: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ErrorWire {
    code: String,
    message: String,
}

impl Event {
    /// Encode into a frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        match self {
            Self::Synced => Frame::empty(Code::Synchronize),
            Self::Backlog(entries) => Frame::new(Code::Backlog, json!({ "entries": entries })),
            Self::PostId { id, op } => Frame::new(Code::PostId, json!({ "id": id, "op": op })),
            Self::Update { thread, update } => {
                Frame::new(update.code(), serde_json::to_value(update).unwrap_or_default())
                    .with_thread(*thread)
            }
            Self::ConfigHash { hash } => Frame::new(Code::ConfigHash, json!({ "hash": hash })),
            Self::Error { code, message } => {
                Frame::new(Code::Error, json!({ "code": code, "message": message }))
            }
        }
    }

    /// Decode a frame received from the server.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unexpected`] for client-only codes and
    /// [`CodecError::Malformed`] for payloads that do not fit the code.
    pub fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        let code = frame.code;
        match code {
            Code::Synchronize => Ok(Self::Synced),
            Code::Backlog => payload::<BacklogWire>(frame).map(|w| Self::Backlog(w.entries)),
            Code::PostId => payload::<PostIdWire>(frame).map(|w| Self::PostId { id: w.id, op: w.op }),
            Code::ConfigHash => payload::<HashWire>(frame).map(|w| Self::ConfigHash { hash: w.hash }),
            Code::Error => payload::<ErrorWire>(frame).map(|w| Self::Error {
                code: w.code,
                message: w.message,
            }),
            Code::InsertThread
            | Code::InsertPost
            | Code::Append
            | Code::Backspace
            | Code::Splice
            | Code::FinishPost
            | Code::InsertImage => {
                let thread = frame
                    .thread
                    .ok_or_else(|| CodecError::malformed(code, "update without thread"))?;
                let update: PostUpdate = serde_json::from_value(frame.data.clone())
                    .map_err(|e| CodecError::malformed(code, e.to_string()))?;
                if update.code() != code {
                    return Err(CodecError::malformed(code, "update type does not match code"));
                }
                Ok(Self::Update { thread, update })
            }
            Code::UpdatePost | Code::ReclaimPost | Code::Resync | Code::Desync => {
                Err(CodecError::Unexpected(code))
            }
        }
    }
}

/// Serialize an update for storage in a backlog.
#[must_use]
pub fn backlog_payload(update: &PostUpdate) -> String {
    serde_json::to_string(update).unwrap_or_else(|_| Value::Null.to_string())
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
