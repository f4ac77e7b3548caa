//! Discovery endpoint (C8): `GET /tools?q=...` — read-only tool metadata,
//! deliberately NOT allowlist-gated (see §4.8's documented design exception).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditLog;
use crate::broker::auth::check_bearer;
use crate::broker::error_body;
use crate::error::ErrorKind;
use crate::model::ToolSchema;
use crate::rate_limiter::RateLimiter;
use crate::upstream::ClientPool;

const MAX_QUERY_LEN: usize = 100;

#[derive(Debug, Deserialize)]
pub struct DiscoveryQuery {
    #[serde(default, rename = "q")]
    pub q: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ToolSummary {
    name: String,
    description: Option<String>,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
}

impl From<&ToolSchema> for ToolSummary {
    fn from(s: &ToolSchema) -> Self {
        Self {
            name: s.name.clone(),
            description: s.description.clone(),
            input_schema: s.input_schema.clone(),
        }
    }
}

pub struct DiscoveryState {
    pub token: String,
    pub execution_id: String,
    pub rate_limiter: Arc<RateLimiter>,
    pub client_pool: Arc<ClientPool>,
    pub audit_log: Arc<AuditLog>,
    /// Fan-out budget for the discovery call, sourced from
    /// `discovery_timeout_ms` — distinct from a single tool call's timeout.
    pub fanout_timeout: Duration,
}

pub fn router(state: Arc<DiscoveryState>) -> Router {
    Router::new().route("/tools", get(handle_discovery)).with_state(state)
}

fn valid_query_term(q: &str) -> bool {
    q.len() <= MAX_QUERY_LEN
        && q.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ' ')
}

async fn handle_discovery(
    State(state): State<Arc<DiscoveryState>>,
    headers: HeaderMap,
    Query(query): Query<DiscoveryQuery>,
) -> (StatusCode, Json<Value>) {
    if !check_bearer(&headers, &state.token) {
        let (status, body) = error_body(ErrorKind::Forbidden, "unauthorized", None);
        return (status, body);
    }

    for term in &query.q {
        if !valid_query_term(term) {
            let (status, body) = error_body(ErrorKind::BadArguments, format!("invalid search term: {term}"), None);
            return (status, body);
        }
    }

    let decision = state
        .rate_limiter
        .check_limit(&format!("discovery:{}", state.execution_id));
    if !decision.allowed {
        let (status, body) = error_body(
            ErrorKind::RateLimited,
            "rate limit exceeded",
            Some(decision.reset_in_ms),
        );
        return (status, body);
    }

    let fanout = state.client_pool.list_all_tool_schemas();
    let schemas = match tokio::time::timeout(state.fanout_timeout, fanout).await {
        Ok(schemas) => schemas,
        Err(_) => {
            state.audit_log.append(serde_json::json!({
                "action": "discovery",
                "endpoint": "/tools",
                "searchTerms": query.q,
                "resultsCount": 0,
                "timestamp": crate::model::now_secs(),
                "error": "timeout",
            }));
            let (status, body) = error_body(
                ErrorKind::Timeout,
                format!("discovery fan-out timed out after {:?}", state.fanout_timeout),
                None,
            );
            return (status, body);
        }
    };

    let filtered: Vec<ToolSummary> = if query.q.is_empty() {
        schemas.iter().map(ToolSummary::from).collect()
    } else {
        schemas
            .iter()
            .filter(|s| {
                query.q.iter().any(|term| {
                    let term = term.to_lowercase();
                    s.name.to_lowercase().contains(&term)
                        || s.description
                            .as_deref()
                            .map(|d| d.to_lowercase().contains(&term))
                            .unwrap_or(false)
                })
            })
            .map(ToolSummary::from)
            .collect()
    };

    state.audit_log.append(serde_json::json!({
        "action": "discovery",
        "endpoint": "/tools",
        "searchTerms": query.q,
        "resultsCount": filtered.len(),
        "timestamp": crate::model::now_secs(),
    }));

    (
        StatusCode::OK,
        Json(serde_json::json!({ "tools": filtered })),
    )
}
