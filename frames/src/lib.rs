//! Shared wire model for the live post protocol.
//!
//! This crate owns everything both ends of the socket must agree on: message
//! codes, the protobuf frame envelope, typed command and event payloads, the
//! text diff encoder, and the size limits both sides enforce.
//!
//! DESIGN
//! ======
//! A [`Frame`] is a numeric [`Code`], an optional thread id, and a JSON
//! payload. Payloads stay `serde_json::Value` on the envelope so the codec is
//! independent of individual message shapes; [`Command`] and [`Event`] give
//! the typed view and reject frames whose payload does not match the code.

pub mod command;
pub mod diff;
pub mod event;
pub mod limits;

pub use command::{Command, PostRequest, SyncRequest, ThreadRequest};
pub use diff::{Edit, Splice, diff};
pub use event::{BacklogEntry, Event, PostSnapshot, PostUpdate, RECLAIM_FAILED, backlog_payload};

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Thread identifier. Equal to the id of the thread's opening post.
pub type ThreadId = u64;

/// Post identifier, unique across the whole site.
pub type PostId = u64;

/// Error returned when decoding bytes or interpreting a frame payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireFrame`.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The `code` integer on the wire does not map to a known [`Code`].
    #[error("unknown message code: {0}")]
    UnknownCode(i32),
    /// The code is known but not valid in this direction.
    #[error("unexpected message code: {0:?}")]
    Unexpected(Code),
    /// The payload does not match the shape required by the code.
    #[error("malformed {code:?} payload: {reason}")]
    Malformed { code: Code, reason: String },
}

impl CodecError {
    pub(crate) fn malformed(code: Code, reason: impl Into<String>) -> Self {
        Self::Malformed { code, reason: reason.into() }
    }
}

/// Message type code. The numeric values are the wire contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Error,
    InsertThread,
    InsertPost,
    Append,
    Backspace,
    Splice,
    FinishPost,
    InsertImage,
    UpdatePost,
    ReclaimPost,
    Synchronize,
    Resync,
    Desync,
    PostId,
    Backlog,
    ConfigHash,
}

impl Code {
    /// Convert the code into its wire integer value.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        let wire = match self {
            Self::Error => WireCode::Error,
            Self::InsertThread => WireCode::InsertThread,
            Self::InsertPost => WireCode::InsertPost,
            Self::Append => WireCode::Append,
            Self::Backspace => WireCode::Backspace,
            Self::Splice => WireCode::Splice,
            Self::FinishPost => WireCode::FinishPost,
            Self::InsertImage => WireCode::InsertImage,
            Self::UpdatePost => WireCode::UpdatePost,
            Self::ReclaimPost => WireCode::ReclaimPost,
            Self::Synchronize => WireCode::Synchronize,
            Self::Resync => WireCode::Resync,
            Self::Desync => WireCode::Desync,
            Self::PostId => WireCode::PostId,
            Self::Backlog => WireCode::Backlog,
            Self::ConfigHash => WireCode::ConfigHash,
        };
        wire as i32
    }

    /// Parse a code from its wire integer value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownCode`] for values outside the table.
    pub fn from_i32(value: i32) -> Result<Self, CodecError> {
        let wire = WireCode::try_from(value).map_err(|_| CodecError::UnknownCode(value))?;
        Ok(match wire {
            WireCode::Error => Self::Error,
            WireCode::InsertThread => Self::InsertThread,
            WireCode::InsertPost => Self::InsertPost,
            WireCode::Append => Self::Append,
            WireCode::Backspace => Self::Backspace,
            WireCode::Splice => Self::Splice,
            WireCode::FinishPost => Self::FinishPost,
            WireCode::InsertImage => Self::InsertImage,
            WireCode::UpdatePost => Self::UpdatePost,
            WireCode::ReclaimPost => Self::ReclaimPost,
            WireCode::Synchronize => Self::Synchronize,
            WireCode::Resync => Self::Resync,
            WireCode::Desync => Self::Desync,
            WireCode::PostId => Self::PostId,
            WireCode::Backlog => Self::Backlog,
            WireCode::ConfigHash => Self::ConfigHash,
        })
    }
}

/// A single message on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Message type.
    pub code: Code,
    /// Thread the message concerns, for post updates fanned out to watchers.
    pub thread: Option<ThreadId>,
    /// Code-specific JSON payload.
    pub data: Value,
}

impl Frame {
    /// Build a frame with no thread tag.
    #[must_use]
    pub fn new(code: Code, data: Value) -> Self {
        Self { code, thread: None, data }
    }

    /// Build a frame with an empty object payload.
    #[must_use]
    pub fn empty(code: Code) -> Self {
        Self::new(code, Value::Object(Map::new()))
    }

    #[must_use]
    pub fn with_thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }
}

/// Encode a frame into protobuf bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let wire = WireFrame {
        code: frame.code.as_i32(),
        thread: frame.thread,
        data: Some(json_to_proto_value(&frame.data)),
    };

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a growable Vec cannot hit `BufferTooSmall`.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode protobuf bytes into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes and
/// [`CodecError::UnknownCode`] for codes outside the table.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let wire = WireFrame::decode(bytes)?;
    Ok(Frame {
        code: Code::from_i32(wire.code)?,
        thread: wire.thread,
        data: wire
            .data
            .map_or(Value::Object(Map::new()), |v| proto_to_json_value(&v)),
    })
}

// Largest integer an f64 carries exactly.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

fn json_to_proto_value(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => {
            prost_types::value::Kind::NullValue(prost_types::NullValue::NullValue as i32)
        }
        Value::Bool(v) => prost_types::value::Kind::BoolValue(*v),
        Value::Number(v) => prost_types::value::Kind::NumberValue(v.as_f64().unwrap_or(0.0)),
        Value::String(v) => prost_types::value::Kind::StringValue(v.clone()),
        Value::Array(v) => prost_types::value::Kind::ListValue(prost_types::ListValue {
            values: v.iter().map(json_to_proto_value).collect(),
        }),
        Value::Object(v) => prost_types::value::Kind::StructValue(prost_types::Struct {
            fields: v
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    };

    prost_types::Value { kind: Some(kind) }
}

/// Protobuf numbers are doubles. Integral values come back as JSON integers
/// so ids and offsets deserialize into `u64`/`usize` fields.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn number_to_json(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < MAX_EXACT_INTEGER {
        if v >= 0.0 {
            return Value::Number((v as u64).into());
        }
        return Value::Number((v as i64).into());
    }
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn proto_to_json_value(value: &prost_types::Value) -> Value {
    let Some(kind) = &value.kind else {
        return Value::Null;
    };

    match kind {
        prost_types::value::Kind::NullValue(_) => Value::Null,
        prost_types::value::Kind::NumberValue(v) => number_to_json(*v),
        prost_types::value::Kind::StringValue(v) => Value::String(v.clone()),
        prost_types::value::Kind::BoolValue(v) => Value::Bool(*v),
        prost_types::value::Kind::StructValue(v) => Value::Object(
            v.fields
                .iter()
                .map(|(k, v)| (k.clone(), proto_to_json_value(v)))
                .collect(),
        ),
        prost_types::value::Kind::ListValue(v) => {
            Value::Array(v.values.iter().map(proto_to_json_value).collect())
        }
    }
}

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(enumeration = "WireCode", tag = "1")]
    code: i32,
    #[prost(uint64, optional, tag = "2")]
    thread: Option<u64>,
    #[prost(message, optional, tag = "3")]
    data: Option<prost_types::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireCode {
    Error = 0,
    InsertThread = 1,
    InsertPost = 2,
    Append = 3,
    Backspace = 4,
    Splice = 5,
    FinishPost = 6,
    InsertImage = 7,
    UpdatePost = 8,
    ReclaimPost = 9,
    Synchronize = 30,
    Resync = 31,
    Desync = 32,
    PostId = 33,
    Backlog = 34,
    ConfigHash = 35,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
