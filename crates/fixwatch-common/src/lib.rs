//! Shared domain types for the fixwatch monitoring engine.
//!
//! - [`activity`]: `Activity` and `ExecutionMetrics`, the per-subject projections
//! - [`event`]: push-stream frame decoding
//! - [`ci`]: CI check model and overall-status derivation

pub mod activity;
pub mod ci;
pub mod event;

pub use activity::{Activity, ActivityKind, ActivityStatus, ExecutionMetrics};
pub use ci::{
    CheckConclusion, CheckStatus, CiCheck, CiOverallStatus, CiStatus, FixRequest, FixResponse,
    compute_overall_status, failed_checks,
};
pub use event::{DecodeError, EventBody, EventKind, StreamEvent, decode_frame, subject_hint};
