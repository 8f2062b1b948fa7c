//! Live event stream ingestion.
//!
//! [`StreamIngestor`] turns a server-push feed of activity, metrics and
//! terminal events into throttled per-subject snapshots.

pub mod ingestor;
pub mod log;
pub mod throttle;
pub mod transport;

pub use ingestor::{ConnectionState, IngestorConfig, StreamIngestor, StreamSnapshot};
pub use log::{DEFAULT_MAX_ACTIVITIES, PendingBuffer, merge_activities};
pub use throttle::{FlushDecision, FlushGate};
pub use transport::{
    ChannelTransport, FrameSender, FrameSource, PushTransport, STREAM_PATH, SseParser,
    SseTransport,
};
