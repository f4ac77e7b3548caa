//! Root error type and per-subsystem error enums.
//!
//! Every subsystem gets its own `thiserror` enum; [`Error`] aggregates them
//! with `#[from]` so `?` composes across module boundaries. Handler- and
//! broker-facing code maps variants to one of the caller-visible kinds in
//! [`ErrorKind`] exactly once, at the HTTP/JSON-RPC edge — nowhere else.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The caller-visible error vocabulary. Every [`Error`] maps to exactly one
/// of these via [`Error::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    BadArguments,
    Forbidden,
    RateLimited,
    QuotaExceeded,
    UpstreamError,
    UpstreamUnavailable,
    Timeout,
    SandboxUnavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl Error {
    /// Map to the caller-visible kind. `Config` errors never reach a caller
    /// (they abort startup before any broker binds a port) so they have no
    /// corresponding kind; callers of `kind()` on a `Config` error get
    /// `Internal` as a safe fallback that should never actually be observed.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Internal,
            Error::Broker(e) => e.kind(),
            Error::Sandbox(e) => e.kind(),
            Error::Cache(_) => ErrorKind::Internal,
            Error::Upstream(e) => e.kind(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Broker(BrokerError::RateLimited { reset_in_ms, .. }) => {
                Some(Duration::from_millis(*reset_in_ms))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("missing required config value {key}: {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to parse config value: {0}")]
    ParseError(String),

    #[error("io error loading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by C7 (tool-call broker), C8 (discovery), C9 (sampling),
/// C6 (schema validator), C3 (rate limiter).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("tool not in allowlist: {tool}")]
    ToolForbidden { tool: String },

    #[error("rate limited, retry after {reset_in_ms}ms")]
    RateLimited { reset_in_ms: u64 },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("unauthorized: invalid or missing bearer token")]
    Unauthorized,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("internal broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::BadArguments(_) => ErrorKind::BadArguments,
            BrokerError::ToolForbidden { .. } => ErrorKind::Forbidden,
            BrokerError::RateLimited { .. } => ErrorKind::RateLimited,
            BrokerError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            BrokerError::Unauthorized => ErrorKind::Forbidden,
            BrokerError::Timeout(_) => ErrorKind::Timeout,
            BrokerError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Errors surfaced by C11 (sandbox supervisor) and C12 (handler).
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn sandbox child: {0}")]
    SpawnFailed(String),

    #[error("execution timeout after {0}ms")]
    Timeout(u64),

    #[error("failed to write scratch file: {0}")]
    ScratchWrite(#[from] std::io::Error),

    #[error("internal sandbox error: {0}")]
    Internal(String),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::SpawnFailed(_) => ErrorKind::SandboxUnavailable,
            SandboxError::Timeout(_) => ErrorKind::Timeout,
            SandboxError::ScratchWrite(_) => ErrorKind::Internal,
            SandboxError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Errors surfaced by C4 (schema cache).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("fetch failed for {name}: {source}")]
    FetchFailed {
        name: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to persist cache to disk: {0}")]
    Persist(#[from] std::io::Error),

    #[error("failed to (de)serialize cache entry: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors surfaced by C1 (circuit breaker), C2 (admission pool), C5
/// (upstream client pool).
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("backend {backend} returned an error: {message}")]
    BackendError { backend: String, message: String },

    #[error("circuit open for backend {backend}")]
    CircuitOpen { backend: String },

    #[error("admission queue full")]
    QueueFull,

    #[error("admission request expired after {0:?} in queue")]
    Expired(Duration),

    #[error("admission pool is draining")]
    Draining,

    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown backend for tool {0}")]
    UnknownBackend(String),
}

impl UpstreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::BackendError { .. } => ErrorKind::UpstreamError,
            UpstreamError::CircuitOpen { .. } => ErrorKind::UpstreamUnavailable,
            UpstreamError::QueueFull => ErrorKind::Internal,
            UpstreamError::Expired(_) => ErrorKind::Timeout,
            UpstreamError::Draining => ErrorKind::UpstreamUnavailable,
            UpstreamError::Timeout(_) => ErrorKind::Timeout,
            UpstreamError::UnknownBackend(_) => ErrorKind::BadArguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_error_kinds() {
        assert_eq!(
            BrokerError::BadArguments("x".into()).kind(),
            ErrorKind::BadArguments
        );
        assert_eq!(
            BrokerError::ToolForbidden { tool: "t".into() }.kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(
            BrokerError::RateLimited { reset_in_ms: 10 }.kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            BrokerError::QuotaExceeded("x".into()).kind(),
            ErrorKind::QuotaExceeded
        );
        assert_eq!(BrokerError::Unauthorized.kind(), ErrorKind::Forbidden);
        assert_eq!(
            BrokerError::Timeout(Duration::from_millis(1)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            BrokerError::Internal("x".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn sandbox_error_kinds() {
        assert_eq!(
            SandboxError::SpawnFailed("x".into()).kind(),
            ErrorKind::SandboxUnavailable
        );
        assert_eq!(SandboxError::Timeout(200).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn upstream_error_kinds() {
        assert_eq!(
            UpstreamError::CircuitOpen {
                backend: "fs".into()
            }
            .kind(),
            ErrorKind::UpstreamUnavailable
        );
        assert_eq!(
            UpstreamError::Expired(Duration::from_millis(100)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(UpstreamError::Draining.kind(), ErrorKind::UpstreamUnavailable);
    }

    #[test]
    fn from_conversions_compose() {
        let e: Error = UpstreamError::QueueFull.into();
        assert_eq!(e.kind(), ErrorKind::Internal);
        assert!(e.to_string().contains("queue full"));
    }

    #[test]
    fn retry_after_only_on_rate_limited() {
        let e: Error = BrokerError::RateLimited { reset_in_ms: 500 }.into();
        assert_eq!(e.retry_after(), Some(Duration::from_millis(500)));

        let e: Error = BrokerError::Unauthorized.into();
        assert_eq!(e.retry_after(), None);
    }

    #[test]
    fn error_kind_serializes_camel_case() {
        let json = serde_json::to_string(&ErrorKind::UpstreamUnavailable).unwrap();
        assert_eq!(json, "\"upstreamUnavailable\"");
    }
}
