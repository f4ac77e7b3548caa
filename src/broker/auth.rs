//! Constant-time bearer token check shared by every loopback broker.

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

/// Returns `true` iff `headers` carries `Authorization: Bearer <token>` with
/// the exact configured token. Comparison is constant-time so a timing side
/// channel can't be used to guess the token byte-by-byte.
pub fn check_bearer(headers: &HeaderMap, expected: &str) -> bool {
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let Some(presented) = value.strip_prefix("Bearer ") else {
        return false;
    };

    let expected = expected.as_bytes();
    let presented = presented.as_bytes();
    if presented.len() != expected.len() {
        return false;
    }
    presented.ct_eq(expected).into()
}
