//! Shared HTTP utilities for the redirect token workspace.
//!
//! Framework-agnostic response bodies, URL building, client address
//! extraction and time formatting used by the api-server.

use chrono::{DateTime, SecondsFormat, Utc};
use std::time::SystemTime;

// ============================================================================
// JSON Response Helpers (framework-agnostic)
// ============================================================================

/// Create a structured error JSON with a default message based on the code.
///
/// Returns: `{"error": {"code": "<code>", "message": "<default message>"}}`
pub fn json_err(code: &str) -> serde_json::Value {
    let message = match code {
        "not_found" => "Resource not found",
        "bad_request" => "Bad request",
        "invalid_request" => "Invalid request",
        "unauthorized" => "Authentication required",
        "conflict" => "Resource state changed",
        "error" | "internal" => "Internal server error",
        _ => code, // Fallback to code as message for unknown codes
    };
    serde_json::json!({"error": {"code": code, "message": message}})
}

/// Create a structured error JSON with a custom message.
///
/// Returns: `{"error": {"code": "<code>", "message": "<message>"}}`
pub fn json_error_with_message(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({"error": {"code": code, "message": message}})
}

// ============================================================================
// URL Building
// ============================================================================

/// Build the full redeemable URL for a token.
///
/// Uses `base` (e.g. `https://links.example.com`) when given, otherwise
/// `https://{host}`, otherwise a root-relative path.
pub fn build_redeem_url(base: Option<&str>, host: &str, prefix: &str, token: &str) -> String {
    let prefix = prefix.trim_matches('/');
    match base.filter(|b| !b.is_empty()) {
        Some(b) => format!("{}/{}/{}", b.trim_end_matches('/'), prefix, token),
        None if !host.is_empty() => format!("https://{}/{}/{}", host, prefix, token),
        None => format!("/{}/{}", prefix, token),
    }
}

// ============================================================================
// Client Address
// ============================================================================

/// Pick the client address for audit records: the first non-empty entry of
/// an `X-Forwarded-For` value, else the socket peer, else `"unknown"`.
pub fn client_ip(forwarded_for: Option<&str>, peer: Option<&str>) -> String {
    forwarded_for
        .and_then(|v| v.split(',').map(str::trim).find(|s| !s.is_empty()))
        .or(peer)
        .unwrap_or("unknown")
        .to_string()
}

// ============================================================================
// Time Utilities
// ============================================================================

/// Convert SystemTime to RFC3339 string (millisecond precision, UTC).
pub fn system_time_to_rfc3339(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Query Parsing
// ============================================================================

/// Validate a `limit` query value: `None` → `default`, `Some(n)` must be in
/// 1..=500.
pub fn resolve_limit(limit: Option<usize>, default: usize) -> Option<usize> {
    match limit {
        None => Some(default),
        Some(n) if (1..=500).contains(&n) => Some(n),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_json_err() {
        let err = json_err("not_found");
        assert_eq!(
            err,
            serde_json::json!({"error": {"code": "not_found", "message": "Resource not found"}})
        );

        // Unknown code falls back to code as message
        let err = json_err("custom_error");
        assert_eq!(
            err,
            serde_json::json!({"error": {"code": "custom_error", "message": "custom_error"}})
        );
    }

    #[test]
    fn test_json_error_with_message() {
        let err = json_error_with_message("bad_request", "Invalid input");
        assert_eq!(
            err,
            serde_json::json!({"error": {"code": "bad_request", "message": "Invalid input"}})
        );
    }

    #[test]
    fn test_build_redeem_url() {
        assert_eq!(
            build_redeem_url(Some("https://l.example/"), "ignored", "/go/", "abc"),
            "https://l.example/go/abc"
        );
        assert_eq!(
            build_redeem_url(None, "example.com", "news", "abc"),
            "https://example.com/news/abc"
        );
        assert_eq!(build_redeem_url(Some(""), "", "go", "abc"), "/go/abc");
    }

    #[test]
    fn test_client_ip() {
        assert_eq!(
            client_ip(Some("203.0.113.9, 10.0.0.1"), Some("10.0.0.1")),
            "203.0.113.9"
        );
        assert_eq!(client_ip(Some(" , "), Some("10.0.0.1")), "10.0.0.1");
        assert_eq!(client_ip(None, Some("10.0.0.1")), "10.0.0.1");
        assert_eq!(client_ip(None, None), "unknown");
    }

    #[test]
    fn test_system_time_to_rfc3339() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(system_time_to_rfc3339(t), "1970-01-01T00:00:01.500Z");
    }

    #[test]
    fn test_resolve_limit() {
        assert_eq!(resolve_limit(None, 100), Some(100));
        assert_eq!(resolve_limit(Some(1), 100), Some(1));
        assert_eq!(resolve_limit(Some(500), 100), Some(500));
        assert_eq!(resolve_limit(Some(0), 100), None);
        assert_eq!(resolve_limit(Some(501), 100), None);
    }
}
