//! CI check model and the overall-status derivation.
//!
//! `CiOverallStatus` is never trusted from the wire: [`compute_overall_status`]
//! recomputes it from the check list on every poll.

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Queued,
    InProgress,
    Completed,
    /// Provider-specific states such as `waiting` or `requested`.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
    Skipped,
    /// `cancelled`, `neutral`, `timed_out`, ... Counts as neither success nor failure.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiCheck {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub conclusion: Option<CheckConclusion>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub details_url: Option<String>,
}

impl CiCheck {
    pub fn is_failure(&self) -> bool {
        self.conclusion == Some(CheckConclusion::Failure)
    }
}

/// CI providers hand out numeric check ids; the dashboard API forwards them
/// either as numbers or strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CiOverallStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
    Mixed,
}

impl CiOverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Mixed => "mixed",
        }
    }

    /// Polling stops once a terminal status is reached.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Mixed)
    }

    pub fn is_failing(&self) -> bool {
        matches!(self, Self::Failure | Self::Mixed)
    }
}

impl std::fmt::Display for CiOverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CI status for one (branch, sha) pair, replaced wholesale on every poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiStatus {
    pub sha: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub checks: Vec<CiCheck>,
    #[serde(default)]
    pub overall_status: CiOverallStatus,
    #[serde(default)]
    pub last_polled_at: Option<String>,
}

impl CiStatus {
    /// Recompute `overall_status` from the checks, discarding whatever the
    /// server claimed.
    pub fn with_derived_status(mut self) -> Self {
        self.overall_status = compute_overall_status(&self.checks);
        self
    }

    pub fn failed_checks(&self) -> Vec<CiCheck> {
        failed_checks(&self.checks)
    }
}

/// Derive the overall CI status from a list of checks.
///
/// 1. no checks → pending
/// 2. any in progress → running
/// 3. any queued → pending
/// 4. all completed → mixed / failure / success by conclusion
/// 5. anything else → pending
pub fn compute_overall_status(checks: &[CiCheck]) -> CiOverallStatus {
    if checks.is_empty() {
        return CiOverallStatus::Pending;
    }
    if checks.iter().any(|c| c.status == CheckStatus::InProgress) {
        return CiOverallStatus::Running;
    }
    if checks.iter().any(|c| c.status == CheckStatus::Queued) {
        return CiOverallStatus::Pending;
    }
    if checks.iter().all(|c| c.status == CheckStatus::Completed) {
        let has_failure = checks.iter().any(CiCheck::is_failure);
        let has_success = checks
            .iter()
            .any(|c| c.conclusion == Some(CheckConclusion::Success));
        return match (has_failure, has_success) {
            (true, true) => CiOverallStatus::Mixed,
            (true, false) => CiOverallStatus::Failure,
            _ => CiOverallStatus::Success,
        };
    }
    CiOverallStatus::Pending
}

/// Checks whose conclusion is `failure`. Skipped checks never count.
pub fn failed_checks(checks: &[CiCheck]) -> Vec<CiCheck> {
    checks.iter().filter(|c| c.is_failure()).cloned().collect()
}

/// Body of `POST /api/ci/fix`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FixRequest {
    pub subject_id: String,
    pub sha: String,
    pub branch: String,
    pub failed_checks: Vec<String>,
}

/// Response of `POST /api/ci/fix`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FixResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fix_attempted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_commit_sha: Option<String>,
}

impl FixResponse {
    /// A failed outcome for a fix that never reached the server.
    pub fn not_attempted(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            fix_attempted: false,
            new_commit_sha: None,
        }
    }
}
