//! CI status and auto-fix API.

use async_trait::async_trait;
use chrono::Utc;
use fixwatch_common::{CiStatus, FixRequest, FixResponse};
use tracing::debug;

use super::monitor::CiTarget;
use crate::errors::CiApiError;
use crate::util::{endpoint, response_error_message};

pub const STATUS_PATH: &str = "/api/ci/status";
pub const FIX_PATH: &str = "/api/ci/fix";

/// The dashboard endpoints the monitor talks to.
#[async_trait]
pub trait CiApi: Send + Sync + 'static {
    /// Current CI status for `target`. The returned `overall_status` is
    /// always derived from the checks.
    async fn fetch_status(&self, target: &CiTarget) -> Result<CiStatus, CiApiError>;

    async fn request_fix(&self, request: &FixRequest) -> Result<FixResponse, CiApiError>;
}

/// reqwest implementation of [`CiApi`].
#[derive(Debug, Clone)]
pub struct HttpCiApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCiApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Query for the status endpoint: `branch&sha`, or `sha&owner&repo` when the
/// target names a repository.
fn status_query(target: &CiTarget) -> Vec<(&'static str, String)> {
    match (&target.owner, &target.repo) {
        (Some(owner), Some(repo)) => vec![
            ("sha", target.sha.clone()),
            ("owner", owner.clone()),
            ("repo", repo.clone()),
        ],
        _ => vec![("branch", target.branch.clone()), ("sha", target.sha.clone())],
    }
}

#[async_trait]
impl CiApi for HttpCiApi {
    async fn fetch_status(&self, target: &CiTarget) -> Result<CiStatus, CiApiError> {
        let url = endpoint(&self.base_url, STATUS_PATH);
        debug!(%url, branch = %target.branch, sha = %target.sha, "fetching CI status");

        let resp = self
            .client
            .get(&url)
            .query(&status_query(target))
            .send()
            .await
            .map_err(CiApiError::Request)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = response_error_message(resp).await;
            return Err(CiApiError::Status { status, message });
        }

        let mut ci: CiStatus = resp.json().await.map_err(CiApiError::Decode)?;
        if ci.branch.is_empty() {
            ci.branch = target.branch.clone();
        }
        if ci.last_polled_at.is_none() {
            ci.last_polled_at = Some(Utc::now().to_rfc3339());
        }
        Ok(ci.with_derived_status())
    }

    async fn request_fix(&self, request: &FixRequest) -> Result<FixResponse, CiApiError> {
        let url = endpoint(&self.base_url, FIX_PATH);
        debug!(%url, subject = %request.subject_id, checks = ?request.failed_checks, "requesting auto-fix");

        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(CiApiError::Request)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = response_error_message(resp).await;
            return Err(CiApiError::Status { status, message });
        }

        resp.json().await.map_err(CiApiError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::Query, http::StatusCode, routing::{get, post}};
    use fixwatch_common::CiOverallStatus;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> Option<String> {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(e) => {
                eprintln!("Skipping CI API test (sandbox): {:?}", e);
                return None;
            }
        };
        let addr = listener.local_addr().ok()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Some(format!("http://{}", addr))
    }

    async fn status_handler(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        // Echo the query through check names so tests can see what was sent.
        let mut names: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        names.sort();
        let checks: Vec<Value> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                json!({
                    "id": i,
                    "name": name,
                    "status": "completed",
                    "conclusion": if i == 0 { "failure" } else { "success" }
                })
            })
            .collect();
        Json(json!({
            "sha": params.get("sha").cloned().unwrap_or_default(),
            "checks": checks,
            "overallStatus": "success"
        }))
    }

    #[test]
    fn test_status_query_variants() {
        let target = CiTarget::new("main", "abc123");
        assert_eq!(
            status_query(&target),
            vec![("branch", "main".to_string()), ("sha", "abc123".to_string())]
        );

        let target = target.with_repository("org", "service");
        assert_eq!(
            status_query(&target),
            vec![
                ("sha", "abc123".to_string()),
                ("owner", "org".to_string()),
                ("repo", "service".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_status_recomputes_overall_status() {
        let app = Router::new().route(STATUS_PATH, get(status_handler));
        let Some(base_url) = serve(app).await else {
            return;
        };

        let api = HttpCiApi::new(base_url);
        let status = api
            .fetch_status(&CiTarget::new("fix/login", "abc123"))
            .await
            .unwrap();

        assert_eq!(status.sha, "abc123");
        assert_eq!(status.branch, "fix/login");
        assert!(status.last_polled_at.is_some());
        // server claimed success; one failure plus one success is mixed
        assert_eq!(status.overall_status, CiOverallStatus::Mixed);
        let names: Vec<&str> = status.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["branch=fix/login", "sha=abc123"]);
    }

    #[tokio::test]
    async fn test_fetch_status_with_repository_query() {
        let app = Router::new().route(STATUS_PATH, get(status_handler));
        let Some(base_url) = serve(app).await else {
            return;
        };

        let api = HttpCiApi::new(base_url);
        let target = CiTarget::new("main", "def456").with_repository("org", "service");
        let status = api.fetch_status(&target).await.unwrap();
        let names: Vec<&str> = status.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["owner=org", "repo=service", "sha=def456"]);
    }

    #[tokio::test]
    async fn test_fetch_status_error_body() {
        let app = Router::new().route(
            STATUS_PATH,
            get(|| async { (StatusCode::NOT_FOUND, Json(json!({"error": "sha not found"}))) }),
        );
        let Some(base_url) = serve(app).await else {
            return;
        };

        let api = HttpCiApi::new(base_url);
        match api.fetch_status(&CiTarget::new("main", "nope")).await {
            Err(CiApiError::Status { status, message }) => {
                assert_eq!(status, 404);
                assert_eq!(message, "sha not found");
            }
            other => panic!("Expected Status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_fix_posts_failed_checks() {
        let app = Router::new().route(
            FIX_PATH,
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "success": true,
                    "fixAttempted": true,
                    "message": format!("fixing {}", body["failedChecks"][0].as_str().unwrap_or("")),
                    "newCommitSha": "fff999",
                    "echo": body
                }))
            }),
        );
        let Some(base_url) = serve(app).await else {
            return;
        };

        let api = HttpCiApi::new(base_url);
        let request = FixRequest {
            subject_id: "run-1".to_string(),
            sha: "abc123".to_string(),
            branch: "main".to_string(),
            failed_checks: vec!["lint".to_string()],
        };
        let response = api.request_fix(&request).await.unwrap();
        assert!(response.success);
        assert!(response.fix_attempted);
        assert_eq!(response.message, "fixing lint");
        assert_eq!(response.new_commit_sha.as_deref(), Some("fff999"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_request_error() {
        // Port 9 (discard) on localhost is virtually never listening.
        let api = HttpCiApi::new("http://127.0.0.1:9");
        let err = api
            .fetch_status(&CiTarget::new("main", "abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, CiApiError::Request(_)));
    }
}
