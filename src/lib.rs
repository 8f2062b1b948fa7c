//! Live monitoring engine for automated remediation runs.
//!
//! - [`stream`]: consumes a server-push event feed into per-subject activity
//!   logs and metrics
//! - [`ci`]: polls CI status for a commit and requests automated fixes
//!
//! The wire model lives in the `fixwatch-common` crate and is re-exported
//! here.

pub mod ci;
pub mod config;
pub mod errors;
pub mod stream;
pub mod telemetry;
pub mod ui;
pub mod util;

pub use fixwatch_common as model;

pub use ci::{CiMonitor, CiTarget, MonitorConfig, MonitorSnapshot, PollState};
pub use errors::{CiApiError, TransportError};
pub use stream::{ConnectionState, IngestorConfig, StreamIngestor, StreamSnapshot};
