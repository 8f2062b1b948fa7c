//! Logging bootstrap for the `fixwatch` binary.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the binary so embedders keep control of their own output.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

/// Environment variable holding a `tracing` filter directive.
pub const LOG_ENV: &str = "FIXWATCH_LOG";

const DEFAULT_FILTER: &str = "fixwatch=info";
const VERBOSE_FILTER: &str = "fixwatch=debug";

/// Pick the filter directive: `FIXWATCH_LOG`, then `RUST_LOG`, then the
/// default (or its debug variant with `--verbose`).
pub fn filter_directive(verbose: bool) -> String {
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| {
            if verbose {
                VERBOSE_FILTER.to_string()
            } else {
                DEFAULT_FILTER.to_string()
            }
        })
}

/// Install the global subscriber, writing to stderr. With `json`, one JSON
/// object per event.
pub fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    let directive = filter_directive(verbose);
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| anyhow!("Invalid log filter '{}': {}", directive, e))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}
