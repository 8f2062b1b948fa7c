use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of step an activity represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Tool,
    Message,
    Result,
    Error,
    Push,
    Ci,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Message => "message",
            Self::Result => "result",
            Self::Error => "error",
            Self::Push => "push",
            Self::Ci => "ci",
        }
    }
}

impl FromStr for ActivityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool" => Ok(Self::Tool),
            "message" => Ok(Self::Message),
            "result" => Ok(Self::Result),
            "error" => Ok(Self::Error),
            "push" => Ok(Self::Push),
            "ci" => Ok(Self::Ci),
            _ => Err(format!("Invalid activity kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Pending,
    Success,
    Error,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// One observable step in a remediation run.
///
/// `id` is stable across re-deliveries: a second activity carrying the same id
/// is an update of the first, not a new entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub id: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub details: String,
    pub status: ActivityStatus,
}

impl Activity {
    /// Build an activity that did not arrive on the wire (log lines, terminal
    /// markers, undecodable frames). Gets a fresh id and the current time.
    pub fn synthetic(kind: ActivityKind, status: ActivityStatus, details: impl Into<String>) -> Self {
        Self {
            id: format!("{}-{}", kind.as_str(), Uuid::new_v4()),
            timestamp: Utc::now().to_rfc3339(),
            kind,
            details: details.into(),
            status,
        }
    }
}

/// Latest progress snapshot for a subject.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub max_iterations: u32,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub total_duration_ms: f64,
}

impl ExecutionMetrics {
    /// Replace `self` with `next`, keeping the running totals non-decreasing.
    pub fn supersede(&mut self, next: ExecutionMetrics) {
        let total_cost_usd = self.total_cost_usd.max(next.total_cost_usd);
        let total_duration_ms = self.total_duration_ms.max(next.total_duration_ms);
        *self = ExecutionMetrics {
            total_cost_usd,
            total_duration_ms,
            ..next
        };
    }

    /// Fraction of the iteration budget used, if a budget is known.
    pub fn progress(&self) -> Option<f64> {
        if self.max_iterations == 0 {
            None
        } else {
            Some((self.iteration as f64 / self.max_iterations as f64).min(1.0))
        }
    }
}
