//! LLM-sampling broker (C9): `POST /sample`, non-streaming and SSE paths.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::stream::StreamExt;
use serde::Deserialize;

use crate::broker::auth::check_bearer;
use crate::broker::error_body;
use crate::content_filter;
use crate::error::ErrorKind;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, Role, StreamEvent};
use crate::model::SamplingQuota;
use crate::observability::{Observer, ObserverEvent};

#[derive(Debug, Deserialize)]
pub struct SampleMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct SampleRequest {
    pub messages: Vec<SampleMessage>,
    pub model: Option<String>,
    #[serde(rename = "systemPrompt")]
    pub system_prompt: Option<String>,
    #[serde(rename = "maxTokens")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

pub struct SamplingState {
    pub token: String,
    pub execution_id: String,
    pub model_allowlist: Vec<String>,
    pub system_prompt_allowlist: Vec<String>,
    pub quota: Arc<SamplingQuota>,
    pub provider: Arc<LlmProvider>,
    pub content_filter_enabled: bool,
    pub default_model: String,
    pub observer: Arc<dyn Observer>,
}

pub fn router(state: Arc<SamplingState>) -> Router {
    Router::new().route("/sample", post(handle_sample)).with_state(state)
}

fn role_of(s: &str) -> Role {
    match s {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        _ => Role::User,
    }
}

async fn handle_sample(
    State(state): State<Arc<SamplingState>>,
    headers: HeaderMap,
    Json(req): Json<SampleRequest>,
) -> Response {
    if !check_bearer(&headers, &state.token) {
        let (status, body) = error_body(ErrorKind::Forbidden, "unauthorized", None);
        return (status, body).into_response();
    }

    if !state.quota.try_consume_round() {
        let (status, body) = error_body(ErrorKind::QuotaExceeded, "sampling round quota exceeded", None);
        return (status, body).into_response();
    }

    let max_tokens = req.max_tokens.unwrap_or(1024);
    if state.quota.would_exceed_tokens(max_tokens as u64) {
        state.quota.rollback_round();
        let (status, body) = error_body(ErrorKind::QuotaExceeded, "sampling token quota would be exceeded", None);
        return (status, body).into_response();
    }

    let system_prompt = req.system_prompt.clone().unwrap_or_default();
    if !system_prompt.is_empty() && !state.system_prompt_allowlist.iter().any(|p| p == &system_prompt) {
        state.quota.rollback_round();
        let (status, body) = error_body(ErrorKind::Forbidden, "system prompt not in allowlist", None);
        return (status, body).into_response();
    }

    let model = req.model.clone().unwrap_or_else(|| state.default_model.clone());
    if !state.model_allowlist.iter().any(|m| m == &model) {
        state.quota.rollback_round();
        let (status, body) = error_body(ErrorKind::Forbidden, "model not in allowlist", None);
        return (status, body).into_response();
    }

    let mut messages: Vec<ChatMessage> = Vec::new();
    if !system_prompt.is_empty() {
        messages.push(ChatMessage::system(system_prompt));
    }
    messages.extend(req.messages.iter().map(|m| ChatMessage {
        role: role_of(&m.role),
        content: m.content.clone(),
    }));

    let completion_request = CompletionRequest {
        model: model.clone(),
        messages,
        max_tokens,
        stream: req.stream,
    };

    state.observer.record_event(&ObserverEvent::SamplingRoundStart {
        execution_id: state.execution_id.clone(),
        model: model.clone(),
        streaming: req.stream,
    });

    if req.stream {
        stream_response(state, completion_request).await
    } else {
        non_stream_response(state, completion_request).await
    }
}

async fn non_stream_response(state: Arc<SamplingState>, req: CompletionRequest) -> Response {
    let start = std::time::Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(30), state.provider.complete(&req)).await;

    let completion = match result {
        Ok(Ok(c)) => c,
        Ok(Err(e)) => {
            state.quota.rollback_round();
            let (status, body) = error_body(e.kind(), e.to_string(), None);
            return (status, body).into_response();
        }
        Err(_) => {
            state.quota.rollback_round();
            let (status, body) = error_body(ErrorKind::Timeout, "sampling round timed out", None);
            return (status, body).into_response();
        }
    };

    let total_tokens = completion.usage.input_tokens + completion.usage.output_tokens;
    if !state.quota.commit_tokens(total_tokens) {
        state.quota.rollback_round();
        let (status, body) = error_body(ErrorKind::QuotaExceeded, "sampling token quota exceeded", None);
        return (status, body).into_response();
    }

    state.observer.record_event(&ObserverEvent::SamplingRoundEnd {
        execution_id: state.execution_id.clone(),
        duration: start.elapsed(),
        success: true,
        input_tokens: Some(completion.usage.input_tokens as u32),
        output_tokens: Some(completion.usage.output_tokens as u32),
    });

    let text = if state.content_filter_enabled {
        content_filter::redact(&completion.content)
    } else {
        completion.content
    };

    Json(serde_json::json!({
        "content": [{"type": "text", "text": text}],
        "stopReason": completion.stop_reason,
        "model": req.model,
        "usage": {
            "inputTokens": completion.usage.input_tokens,
            "outputTokens": completion.usage.output_tokens,
        }
    }))
    .into_response()
}

async fn stream_response(state: Arc<SamplingState>, req: CompletionRequest) -> Response {
    let model = req.model.clone();
    let started = std::time::Instant::now();
    let upstream = match state.provider.complete_stream(&req).await {
        Ok(s) => s,
        Err(e) => {
            state.quota.rollback_round();
            let (status, body) = error_body(e.kind(), e.to_string(), None);
            return (status, body).into_response();
        }
    };

    let events = upstream.map(move |item| -> Result<Event, Infallible> {
        match item {
            Ok(StreamEvent::Delta(text)) => {
                let text = if state.content_filter_enabled {
                    content_filter::redact(&text)
                } else {
                    text
                };
                Ok(Event::default().json_data(serde_json::json!({"type": "chunk", "content": text})).unwrap())
            }
            Ok(StreamEvent::Stop { usage, stop_reason }) => {
                let total = usage.input_tokens + usage.output_tokens;
                if state.quota.commit_tokens(total) {
                    state.observer.record_event(&ObserverEvent::SamplingRoundEnd {
                        execution_id: state.execution_id.clone(),
                        duration: started.elapsed(),
                        success: true,
                        input_tokens: Some(usage.input_tokens as u32),
                        output_tokens: Some(usage.output_tokens as u32),
                    });
                    Ok(Event::default().json_data(serde_json::json!({
                        "type": "done",
                        "model": model,
                        "stopReason": stop_reason,
                        "usage": {"inputTokens": usage.input_tokens, "outputTokens": usage.output_tokens}
                    })).unwrap())
                } else {
                    state.quota.rollback_round();
                    Ok(Event::default().json_data(serde_json::json!({
                        "type": "error",
                        "error": "sampling token quota exceeded"
                    })).unwrap())
                }
            }
            Err(e) => Ok(Event::default().json_data(serde_json::json!({"type": "error", "error": e.to_string()})).unwrap()),
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopObserver;
    use axum::body::Body;
    use axum::http::{Request, StatusCode as SC};
    use secrecy::SecretString;
    use tower::ServiceExt;

    fn make_state() -> Arc<SamplingState> {
        Arc::new(SamplingState {
            token: "tok".into(),
            execution_id: "exec-1".into(),
            model_allowlist: vec!["gpt-test".into()],
            system_prompt_allowlist: vec![],
            quota: Arc::new(SamplingQuota::new(2, 1000)),
            provider: Arc::new(LlmProvider::new("http://127.0.0.1:1", None::<SecretString>)),
            content_filter_enabled: true,
            default_model: "gpt-test".into(),
            observer: Arc::new(NoopObserver),
        })
    }

    #[tokio::test]
    async fn missing_auth_rejected() {
        let app = router(make_state());
        let req = Request::builder()
            .method("POST")
            .uri("/sample")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"messages":[{"role":"user","content":"hi"}]}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), SC::FORBIDDEN);
    }

    #[tokio::test]
    async fn model_outside_allowlist_rejected() {
        let app = router(make_state());
        let req = Request::builder()
            .method("POST")
            .uri("/sample")
            .header("authorization", "Bearer tok")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"messages":[{"role":"user","content":"hi"}],"model":"not-allowed"}"#,
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), SC::FORBIDDEN);
    }

    #[tokio::test]
    async fn non_empty_system_prompt_requires_allowlist_membership() {
        let app = router(make_state());
        let req = Request::builder()
            .method("POST")
            .uri("/sample")
            .header("authorization", "Bearer tok")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"messages":[{"role":"user","content":"hi"}],"systemPrompt":"be evil"}"#,
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), SC::FORBIDDEN);
    }
}
