//! Newline-delimited JSON-RPC surface over stdio (§4.16): the process is a
//! tool invoked by an agent host, not a network service. Each request line
//! is `{id, method, params}`; each response line is `{id, result}` or
//! `{id, error}`. `executeTypescript`/`executePython` share one execution
//! shape and differ only in which `Language` C11 is told to use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;

use crate::handler::{ExecuteRequest, Handler};
use crate::sandbox::supervisor::{Language, Permissions};

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PermissionsWire {
    #[serde(default)]
    read: Vec<String>,
    #[serde(default)]
    write: Vec<String>,
    #[serde(default)]
    net: Vec<String>,
}

impl From<PermissionsWire> for Permissions {
    fn from(w: PermissionsWire) -> Self {
        Permissions {
            read: w.read,
            write: w.write,
            net: w.net,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ExecuteParams {
    code: String,
    #[serde(default)]
    allowed_tools: Vec<String>,
    #[serde(default)]
    permissions: PermissionsWire,
    timeout: Option<u64>,
    #[serde(default)]
    enable_sampling: bool,
    max_sampling_rounds: Option<u32>,
    max_sampling_tokens: Option<u64>,
    #[serde(default)]
    allowed_sampling_models: Vec<String>,
    sampling_system_prompt: Option<String>,
    #[serde(default)]
    streaming: bool,
    #[serde(default)]
    skip_dangerous_pattern_check: bool,
}

impl From<ExecuteParams> for ExecuteRequest {
    fn from(p: ExecuteParams) -> Self {
        ExecuteRequest {
            code: p.code,
            allowed_tools: p.allowed_tools,
            permissions: p.permissions.into(),
            timeout: p.timeout.map(Duration::from_millis),
            enable_sampling: p.enable_sampling,
            max_sampling_rounds: p.max_sampling_rounds,
            max_sampling_tokens: p.max_sampling_tokens,
            allowed_sampling_models: p.allowed_sampling_models,
            sampling_system_prompt: p.sampling_system_prompt,
            streaming: p.streaming,
            skip_dangerous_pattern_check: p.skip_dangerous_pattern_check,
        }
    }
}

/// Serves the three JSON-RPC operations over a pair of async readers/writers.
/// Split out from `serve_stdio` so tests can drive it over in-memory pipes
/// instead of the process's real stdin/stdout.
pub struct RpcServer {
    handler: Arc<Handler>,
    started_at: Instant,
    active_executions: Arc<AtomicU64>,
}

impl RpcServer {
    pub fn new(handler: Arc<Handler>) -> Self {
        Self {
            handler,
            started_at: Instant::now(),
            active_executions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reads newline-delimited requests from `input` and writes
    /// newline-delimited responses to `output`. Each request is dispatched
    /// on its own task so a slow execution never blocks other in-flight
    /// requests' responses from being written as they complete; `output`
    /// writes are still serialized through a mutex so lines never interleave.
    pub async fn serve<R, W>(&self, input: R, output: W) -> std::io::Result<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let output = Arc::new(AsyncMutex::new(output));
        let mut lines = BufReader::new(input).lines();

        let mut tasks = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let handler = self.handler.clone();
            let started_at = self.started_at;
            let active = self.active_executions.clone();
            let output = output.clone();

            tasks.push(tokio::spawn(async move {
                let response = dispatch(&handler, started_at, &active, &line).await;
                let mut bytes = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
                bytes.push(b'\n');
                let mut guard = output.lock().await;
                let _ = guard.write_all(&bytes).await;
                let _ = guard.flush().await;
            }));
        }

        for task in tasks {
            let _ = task.await;
        }

        Ok(())
    }
}

async fn dispatch(handler: &Handler, started_at: Instant, active: &AtomicU64, line: &str) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return RpcResponse {
                id: Value::Null,
                result: None,
                error: Some(json!({"kind": "badArguments", "message": format!("malformed request: {e}")})),
            };
        }
    };

    let result = match request.method.as_str() {
        "health" => Ok(json!({
            "status": "ok",
            "uptimeSecs": started_at.elapsed().as_secs(),
            "activeExecutions": active.load(Ordering::Relaxed),
        })),
        "executeTypescript" => execute(handler, active, Language::TypeScript, request.params).await,
        "executePython" => execute(handler, active, Language::Python, request.params).await,
        other => Err(json!({"kind": "badArguments", "message": format!("unknown method: {other}")})),
    };

    match result {
        Ok(value) => RpcResponse {
            id: request.id,
            result: Some(value),
            error: None,
        },
        Err(error) => RpcResponse {
            id: request.id,
            result: None,
            error: Some(error),
        },
    }
}

async fn execute(handler: &Handler, active: &AtomicU64, language: Language, params: Value) -> Result<Value, Value> {
    let params: ExecuteParams = serde_json::from_value(params)
        .map_err(|e| json!({"kind": "badArguments", "message": format!("invalid params: {e}")}))?;

    active.fetch_add(1, Ordering::Relaxed);
    let result = handler.execute(language, params.into()).await;
    active.fetch_sub(1, Ordering::Relaxed);

    serde_json::to_value(&result).map_err(|e| json!({"kind": "internal", "message": e.to_string()}))
}

/// Runs the RPC server against the process's real stdin/stdout. Returns once
/// stdin is closed (EOF).
pub async fn serve_stdio(handler: Arc<Handler>) -> std::io::Result<()> {
    let server = RpcServer::new(handler);
    server.serve(tokio::io::stdin(), tokio::io::stdout()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionPool;
    use crate::audit::AuditLog;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::config::{AdmissionConfig, Config, LlmConfig, SandboxConfig};
    use crate::llm::LlmProvider;
    use crate::observability::{NoopObserver, Observer};
    use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
    use crate::schema_cache::SchemaCache;
    use crate::upstream::{BackendSpec, ClientPool};
    use secrecy::SecretString;

    fn make_handler(dir: &std::path::Path) -> Arc<Handler> {
        let observer: Arc<dyn Observer> = Arc::new(NoopObserver);
        let pool = Arc::new(ClientPool::new(
            Vec::<BackendSpec>::new(),
            Duration::from_millis(200),
            CircuitBreakerConfig::default(),
            Arc::new(AdmissionPool::new(4, 4, Duration::from_secs(1), observer.clone())),
            Arc::new(SchemaCache::new(Default::default(), None, observer.clone())),
            observer.clone(),
        ));
        let config = Arc::new(Config {
            admission: AdmissionConfig {
                max_concurrent: 4,
                queue_size: 4,
                queue_timeout: Duration::from_secs(1),
            },
            state_dir: dir.to_path_buf(),
            audit_log_path: dir.join("audit.jsonl"),
            observability_backend: "none".into(),
            llm: LlmConfig {
                base_url: "http://127.0.0.1:1".into(),
                api_key: None,
                model_allowlist: vec!["gpt-test".into()],
                system_prompt_allowlist: vec![],
            },
            sandbox: SandboxConfig {
                heap_limit_mb: 128,
                backends_config_path: None,
            },
            discovery_timeout_ms: 500,
            tool_call_timeout_ms: 30_000,
            skip_dangerous_pattern_check: false,
        });
        Arc::new(Handler::new(
            config.clone(),
            pool,
            Arc::new(LlmProvider::new(config.llm.base_url.clone(), None::<SecretString>)),
            Arc::new(AuditLog::new(dir.join("audit.jsonl"))),
            observer,
            Arc::new(RateLimiter::new(RateLimiterConfig::default())),
            dir.to_path_buf(),
        ))
    }

    #[tokio::test]
    async fn health_reports_ok_without_touching_any_backend() {
        let dir = tempfile::tempdir().unwrap();
        let server = RpcServer::new(make_handler(dir.path()));
        let input = b"{\"id\":1,\"method\":\"health\",\"params\":{}}\n".to_vec();
        let mut output = Vec::new();
        server.serve(std::io::Cursor::new(input), &mut output).await.unwrap();

        let line = String::from_utf8(output).unwrap();
        let response: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(response["result"]["status"], "ok");
        assert_eq!(response["id"], 1);
    }

    #[tokio::test]
    async fn malformed_request_yields_bad_arguments_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = RpcServer::new(make_handler(dir.path()));
        let input = b"not json at all\n".to_vec();
        let mut output = Vec::new();
        server.serve(std::io::Cursor::new(input), &mut output).await.unwrap();

        let line = String::from_utf8(output).unwrap();
        let response: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(response["error"]["kind"], "badArguments");
    }

    #[tokio::test]
    async fn unknown_method_yields_bad_arguments_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = RpcServer::new(make_handler(dir.path()));
        let input = b"{\"id\":2,\"method\":\"doSomethingElse\",\"params\":{}}\n".to_vec();
        let mut output = Vec::new();
        server.serve(std::io::Cursor::new(input), &mut output).await.unwrap();

        let line = String::from_utf8(output).unwrap();
        let response: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(response["error"]["kind"], "badArguments");
        assert_eq!(response["id"], 2);
    }
}
