//! Typed error hierarchy for the monitoring engine.
//!
//! - `TransportError`: push-connection failures, drive the reconnect policy
//! - `CiApiError`: CI status / fix request failures, drive the poll retry policy
//!
//! Exhaustion (too many reconnects, too many polls) is not an error value: it
//! is surfaced through the `error` field of the published snapshots.
//! Malformed frames never surface at all; see `fixwatch_common::DecodeError`.

use thiserror::Error;

/// Errors from the push connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to event stream: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("Event stream returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to read from event stream: {0}")]
    Read(#[source] reqwest::Error),

    #[error("Event stream closed by server")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Errors from the CI status and auto-fix endpoints.
#[derive(Debug, Error)]
pub enum CiApiError {
    #[error("CI request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("CI API returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to parse CI response: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("{0}")]
    Other(String),
}
