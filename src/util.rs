//! Shared helpers for the HTTP clients and terminal output.

/// Join a base URL and an absolute API path without doubling slashes.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Pull a human-readable message out of an error response body.
///
/// The dashboard API answers non-2xx requests with `{"error": "..."}`; anything
/// else is returned as trimmed text, or a placeholder for an empty body.
pub fn error_message_from_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
        && let Some(msg) = value.get("error").and_then(|v| v.as_str())
    {
        return msg.to_string();
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no error details".to_string()
    } else {
        truncate_str(trimmed, 200)
    }
}

/// Read the body of a failed response and extract its error message.
pub async fn response_error_message(resp: reqwest::Response) -> String {
    match resp.text().await {
        Ok(body) => error_message_from_body(&body),
        Err(e) => format!("unreadable error body: {}", e),
    }
}

/// Truncate a string with ellipsis, respecting char boundaries.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
