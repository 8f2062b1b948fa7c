//! CI status polling and auto-fix requests.

pub mod client;
pub mod monitor;

pub use client::{CiApi, FIX_PATH, HttpCiApi, STATUS_PATH};
pub use monitor::{
    AutoFixCallback, CiMonitor, CiTarget, CompleteCallback, MonitorConfig, MonitorSnapshot,
    PollState,
};
