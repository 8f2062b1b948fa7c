//! Decoding of push-stream frames into typed events.
//!
//! Frames are JSON objects of the form `{ "subjectId", "kind", "payload" }`.
//! The `kind` tag is validated before the payload is looked at; anything that
//! does not decode is reported as a [`DecodeError`] so the caller can fall back
//! to treating the frame as plain text.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::activity::{Activity, ExecutionMetrics};

pub const DEFAULT_COMPLETE_MESSAGE: &str = "Processing complete";
pub const DEFAULT_ERROR_MESSAGE: &str = "Processing failed";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Activity,
    Metrics,
    Complete,
    Error,
    Log,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::Metrics => "metrics",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Log => "log",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activity" => Ok(Self::Activity),
            "metrics" => Ok(Self::Metrics),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            "log" => Ok(Self::Log),
            _ => Err(DecodeError::UnknownKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    Activity(Activity),
    Metrics(ExecutionMetrics),
    Complete { message: String },
    Error { message: String },
    /// Plain-text output line. `result` marks a final-answer line.
    Log { message: String, result: bool },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Activity(_) => EventKind::Activity,
            Self::Metrics(_) => EventKind::Metrics,
            Self::Complete { .. } => EventKind::Complete,
            Self::Error { .. } => EventKind::Error,
            Self::Log { .. } => EventKind::Log,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub subject_id: String,
    pub body: EventBody,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not a valid event envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("unknown event kind '{0}'")]
    UnknownKind(String),

    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {kind} payload: expected a string or an object with a message")]
    MessageShape { kind: &'static str },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    subject_id: String,
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LogPayload {
    Text(String),
    Structured {
        message: String,
        #[serde(default)]
        result: bool,
    },
}

/// Decode one frame.
pub fn decode_frame(frame: &str) -> Result<StreamEvent, DecodeError> {
    let envelope: Envelope = serde_json::from_str(frame).map_err(DecodeError::Envelope)?;
    let kind: EventKind = envelope.kind.parse()?;

    let body = match kind {
        EventKind::Activity => EventBody::Activity(payload_as(kind, envelope.payload)?),
        EventKind::Metrics => EventBody::Metrics(payload_as(kind, envelope.payload)?),
        EventKind::Log => match payload_as::<LogPayload>(kind, envelope.payload)? {
            LogPayload::Text(message) => EventBody::Log {
                message,
                result: false,
            },
            LogPayload::Structured { message, result } => EventBody::Log { message, result },
        },
        EventKind::Complete => EventBody::Complete {
            message: message_of(kind, &envelope.payload)?
                .unwrap_or_else(|| DEFAULT_COMPLETE_MESSAGE.to_string()),
        },
        EventKind::Error => EventBody::Error {
            message: message_of(kind, &envelope.payload)?
                .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
        },
    };

    Ok(StreamEvent {
        subject_id: envelope.subject_id,
        body,
    })
}

/// Best-effort subject id of a frame that failed to decode.
pub fn subject_hint(frame: &str) -> Option<String> {
    let value: Value = serde_json::from_str(frame).ok()?;
    value
        .get("subjectId")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn payload_as<T: serde::de::DeserializeOwned>(
    kind: EventKind,
    payload: Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(payload).map_err(|source| DecodeError::Payload {
        kind: kind.as_str(),
        source,
    })
}

fn message_of(kind: EventKind, payload: &Value) -> Result<Option<String>, DecodeError> {
    match payload {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Object(map) => match map.get("message") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(DecodeError::MessageShape {
                kind: kind.as_str(),
            }),
        },
        _ => Err(DecodeError::MessageShape {
            kind: kind.as_str(),
        }),
    }
}
