//! Loopback brokers (C7-C10): short-lived, per-execution HTTP endpoints the
//! sandboxed child talks to over `localhost`.

pub mod auth;
pub mod discovery;
pub mod output_stream;
pub mod sampling;
pub mod tool_call;

use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::error::ErrorKind;

/// Map a caller-visible [`ErrorKind`] to its HTTP status, per §4.15/§7: one
/// place decides the status code, never duplicated at each call site.
pub fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadArguments => StatusCode::BAD_REQUEST,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
        ErrorKind::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::SandboxUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Build the standard `{error: {kind, message}}` error body used by every
/// broker, optionally carrying a retry hint.
pub fn error_body(kind: ErrorKind, message: impl Into<String>, retry_after_ms: Option<u64>) -> (StatusCode, Json<serde_json::Value>) {
    let mut body = json!({
        "error": {
            "kind": kind,
            "message": message.into(),
        }
    });
    if let Some(ms) = retry_after_ms {
        body["error"]["retryAfterMs"] = json!(ms);
    }
    (status_for_kind(kind), Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_maps_to_403() {
        assert_eq!(status_for_kind(ErrorKind::Forbidden), StatusCode::FORBIDDEN);
    }

    #[test]
    fn rate_limited_maps_to_429() {
        assert_eq!(status_for_kind(ErrorKind::RateLimited), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn error_body_includes_retry_hint() {
        let (status, Json(body)) = error_body(ErrorKind::RateLimited, "too fast", Some(250));
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["retryAfterMs"], 250);
    }
}
