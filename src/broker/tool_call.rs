//! Tool-call broker (C7): `POST /` dispatches one tool invocation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::auth::check_bearer;
use crate::broker::error_body;
use crate::error::ErrorKind;
use crate::model::{Allowlist, InvocationRecord, InvocationStatus, InvocationTracker, ToolId};
use crate::observability::{Observer, ObserverEvent};
use crate::rate_limiter::RateLimiter;
use crate::upstream::ClientPool;
use crate::validator::validate_arguments;

#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    #[serde(rename = "toolName")]
    pub tool_name: String,
    pub params: Value,
}

#[derive(Debug, Serialize)]
struct ToolCallResponse {
    result: Value,
}

pub struct ToolCallState {
    pub token: String,
    pub allowlist: Allowlist,
    pub execution_id: String,
    pub rate_limiter: Arc<RateLimiter>,
    pub client_pool: Arc<ClientPool>,
    pub tracker: Arc<InvocationTracker>,
    pub observer: Arc<dyn Observer>,
    pub call_timeout: Duration,
}

pub fn router(state: Arc<ToolCallState>) -> Router {
    Router::new().route("/", post(handle_call)).with_state(state)
}

async fn handle_call(
    State(state): State<Arc<ToolCallState>>,
    headers: HeaderMap,
    Json(req): Json<ToolCallRequest>,
) -> (StatusCode, Json<Value>) {
    if !check_bearer(&headers, &state.token) {
        let (status, body) = error_body(ErrorKind::Forbidden, "unauthorized", None);
        return (status, body);
    }

    if !state.allowlist.contains(&req.tool_name) {
        let (status, body) = error_body(
            ErrorKind::Forbidden,
            format!(
                "tool '{}' not in allowlist: {:?}",
                req.tool_name,
                state.allowlist.as_slice()
            ),
            None,
        );
        return (status, body);
    }

    let decision = state.rate_limiter.check_limit(&format!("invoke:{}", state.execution_id));
    if !decision.allowed {
        let (status, body) = error_body(
            ErrorKind::RateLimited,
            "rate limit exceeded",
            Some(decision.reset_in_ms),
        );
        return (status, body);
    }

    let Some(tool_id) = ToolId::parse(&req.tool_name) else {
        let (status, body) = error_body(ErrorKind::BadArguments, "malformed tool identifier", None);
        return (status, body);
    };

    if let Ok(schema) = state.client_pool.get_tool_schema(&tool_id).await {
        match validate_arguments(&schema.input_schema, &req.params) {
            Ok(outcome) if !outcome.valid => {
                let message = outcome
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.path, e.message))
                    .collect::<Vec<_>>()
                    .join("; ");
                let (status, body) = error_body(ErrorKind::BadArguments, message, None);
                return (status, body);
            }
            Err(e) => {
                let (status, body) = error_body(ErrorKind::Internal, e.to_string(), None);
                return (status, body);
            }
            Ok(_) => {}
        }
    }

    state.observer.record_event(&ObserverEvent::ToolCallStart {
        tool: req.tool_name.clone(),
        execution_id: state.execution_id.clone(),
    });
    let start = Instant::now();
    let call = state.client_pool.call_tool(&tool_id, &req.params);
    let outcome = tokio::time::timeout(state.call_timeout, call).await;
    let duration = start.elapsed();

    let (status, body, record_status, error_message) = match outcome {
        Ok(Ok(result)) => (
            StatusCode::OK,
            Json(serde_json::to_value(ToolCallResponse { result }).unwrap()),
            InvocationStatus::Ok,
            None,
        ),
        Ok(Err(upstream_err)) => {
            let kind = upstream_err.kind();
            let message = upstream_err.to_string();
            let (status, body) = error_body(kind, message.clone(), None);
            (status, body, InvocationStatus::Error, Some(message))
        }
        Err(_) => {
            let message = format!("tool call timed out after {:?}", state.call_timeout);
            let (status, body) = error_body(ErrorKind::Timeout, message.clone(), None);
            (status, body, InvocationStatus::Error, Some(message))
        }
    };

    state.observer.record_event(&ObserverEvent::ToolCallEnd {
        tool: req.tool_name.clone(),
        execution_id: state.execution_id.clone(),
        duration,
        success: record_status == InvocationStatus::Ok,
        error_message: error_message.clone(),
    });

    state.tracker.record(InvocationRecord {
        tool_name: req.tool_name,
        started_at: crate::model::now_secs(),
        duration_ms: duration.as_millis() as u64,
        status: record_status,
        error_message,
    });

    (status, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionPool;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::observability::NoopObserver;
    use crate::rate_limiter::RateLimiterConfig;
    use crate::schema_cache::SchemaCache;
    use crate::upstream::{BackendSpec, Transport};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_state() -> Arc<ToolCallState> {
        let pool = Arc::new(ClientPool::new(
            vec![BackendSpec {
                name: "fs".into(),
                transport: Transport::HttpStream {
                    base_url: "http://127.0.0.1:1".into(),
                    bearer_token: None,
                },
            }],
            Duration::from_millis(200),
            CircuitBreakerConfig::default(),
            Arc::new(AdmissionPool::new(4, 4, Duration::from_secs(1), Arc::new(NoopObserver))),
            Arc::new(SchemaCache::new(Default::default(), None, Arc::new(NoopObserver))),
            Arc::new(NoopObserver),
        ));
        Arc::new(ToolCallState {
            token: "tok".into(),
            allowlist: Allowlist::new(vec!["prefix__fs__read_file".to_string()]),
            execution_id: "exec-1".into(),
            rate_limiter: Arc::new(RateLimiter::new(RateLimiterConfig::default())),
            client_pool: pool,
            tracker: Arc::new(InvocationTracker::new()),
            observer: Arc::new(NoopObserver),
            call_timeout: Duration::from_millis(500),
        })
    }

    #[tokio::test]
    async fn missing_auth_yields_403() {
        let app = router(make_state());
        let req = Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"toolName":"prefix__fs__read_file","params":{}}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn tool_outside_allowlist_yields_403_and_never_calls_backend() {
        let app = router(make_state());
        let req = Request::builder()
            .method("POST")
            .uri("/")
            .header("authorization", "Bearer tok")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"toolName":"prefix__fs__write_file","params":{}}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn other_methods_yield_405() {
        let app = router(make_state());
        let req = Request::builder().method("GET").uri("/").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
