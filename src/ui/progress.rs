use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use super::render::format_poll_status;
use crate::ci::MonitorSnapshot;

/// Spinner for `fixwatch ci`, showing the poll state and countdown.
///
/// Output goes through `indicatif`, which draws nothing when stderr is not a
/// terminal.
pub struct CiSpinner {
    bar: ProgressBar,
    max_retries: u32,
}

impl CiSpinner {
    /// `label` is shown as the spinner prefix, typically `branch@sha`.
    pub fn new(label: &str, max_retries: u32) -> Self {
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {prefix:.bold} {msg}")
            .expect("progress bar template is a valid static string");

        let bar = ProgressBar::new_spinner();
        bar.set_style(style);
        bar.set_prefix(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));

        Self { bar, max_retries }
    }

    pub fn update(&self, snapshot: &MonitorSnapshot) {
        self.bar
            .set_message(format_poll_status(snapshot, self.max_retries));
    }

    /// Stop the spinner and leave `line` in its place.
    pub fn finish(&self, line: impl Into<String>) {
        self.bar.finish_with_message(line.into());
    }

    pub fn clear(&self) {
        self.bar.finish_and_clear();
    }
}
