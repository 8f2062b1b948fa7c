//! Line formatting for the terminal front-end.

use console::style;
use fixwatch_common::{
    Activity, ActivityStatus, CheckConclusion, CheckStatus, CiCheck, CiOverallStatus,
    ExecutionMetrics,
};

use super::icons::{
    CHECK, CLOCK, CROSS, PENDING, PLUG, PROGRESS, SKIP, WARN, activity_icon,
};
use crate::ci::{MonitorSnapshot, PollState};
use crate::stream::ConnectionState;
use crate::util::truncate_str;

const MAX_DETAILS_LEN: usize = 160;

pub fn format_activity(subject_id: &str, activity: &Activity) -> String {
    let details = truncate_str(activity.details.trim(), MAX_DETAILS_LEN);
    let details = match activity.status {
        ActivityStatus::Pending => style(details).dim().to_string(),
        ActivityStatus::Success => details,
        ActivityStatus::Error => style(details).red().to_string(),
    };
    format!(
        "{} {}{}",
        style(format!("[{}]", subject_id)).cyan(),
        activity_icon(activity.kind),
        details
    )
}

pub fn format_metrics(subject_id: &str, metrics: &ExecutionMetrics) -> String {
    let iteration = match metrics.progress() {
        Some(fraction) => format!(
            "iteration {}/{} ({:.0}%)",
            metrics.iteration,
            metrics.max_iterations,
            fraction * 100.0
        ),
        None => format!("iteration {}", metrics.iteration),
    };
    format!(
        "{} {}{} | ${:.4} total | {:.1}s total",
        style(format!("[{}]", subject_id)).cyan(),
        PROGRESS,
        iteration,
        metrics.total_cost_usd,
        metrics.total_duration_ms / 1000.0
    )
}

pub fn format_connection(state: ConnectionState, error: Option<&str>) -> String {
    let label = match state {
        ConnectionState::Connected => style(state.as_str()).green().to_string(),
        ConnectionState::Connecting => style(state.as_str()).yellow().to_string(),
        ConnectionState::Error => style(state.as_str()).red().to_string(),
        ConnectionState::Disconnected => style(state.as_str()).dim().to_string(),
    };
    match error {
        Some(error) => format!("{}{}: {}", PLUG, label, error),
        None => format!("{}{}", PLUG, label),
    }
}

pub fn format_check(check: &CiCheck) -> String {
    let (icon, name) = match (check.status, check.conclusion) {
        (CheckStatus::Completed, Some(CheckConclusion::Success)) => {
            (&CHECK, style(&check.name).green().to_string())
        }
        (CheckStatus::Completed, Some(CheckConclusion::Failure)) => {
            (&CROSS, style(&check.name).red().bold().to_string())
        }
        (CheckStatus::Completed, Some(CheckConclusion::Skipped)) => {
            (&SKIP, style(&check.name).dim().to_string())
        }
        (CheckStatus::Completed, _) => (&WARN, style(&check.name).yellow().to_string()),
        _ => (&PENDING, check.name.clone()),
    };
    match &check.details_url {
        Some(url) => format!("  {}{} {}", icon, name, style(url).dim()),
        None => format!("  {}{}", icon, name),
    }
}

pub fn format_overall(status: CiOverallStatus) -> String {
    match status {
        CiOverallStatus::Success => format!("{}CI {}", CHECK, style("passed").green().bold()),
        CiOverallStatus::Failure => format!("{}CI {}", CROSS, style("failed").red().bold()),
        CiOverallStatus::Mixed => format!(
            "{}CI {}",
            WARN,
            style("finished with failures").yellow().bold()
        ),
        CiOverallStatus::Pending | CiOverallStatus::Running => {
            format!("{}CI {}", PENDING, status)
        }
    }
}

/// One-line spinner message for the monitor's current state.
pub fn format_poll_status(snapshot: &MonitorSnapshot, max_retries: u32) -> String {
    let overall = snapshot
        .status
        .as_ref()
        .map(|s| s.overall_status.as_str())
        .unwrap_or("unknown");
    let line = match snapshot.state {
        PollState::Polling => format!(
            "polling (attempt {}/{}) | CI {}",
            snapshot.poll_count, max_retries, overall
        ),
        PollState::Waiting => format!(
            "{}next poll in {}s (attempt {}/{}) | CI {}",
            CLOCK, snapshot.countdown_secs, snapshot.poll_count, max_retries, overall
        ),
        PollState::Idle => format!("idle | CI {}", overall),
        PollState::Error => "stopped".to_string(),
    };
    match &snapshot.error {
        Some(error) if snapshot.state != PollState::Error => {
            format!("{} | {}", line, style(error).yellow())
        }
        Some(error) => format!("{}: {}", line, style(error).red()),
        None => line,
    }
}
