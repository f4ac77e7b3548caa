//! A single upstream backend connection: local-process (stdio) or HTTP.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::error::UpstreamError;
use crate::model::{now_secs, ToolSchema};

#[derive(Debug, Clone)]
pub enum Transport {
    /// A subprocess speaking newline-delimited JSON over stdio.
    LocalProcess { command: String, args: Vec<String> },
    /// A plain HTTP backend (SSE downgrade is negotiated per request, not here).
    HttpStream {
        base_url: String,
        bearer_token: Option<SecretString>,
    },
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    op: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Deserialize, Default)]
struct RpcResponse {
    #[serde(default)]
    tools: Vec<RawSchema>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct RawSchema {
    name: String,
    description: Option<String>,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
    #[serde(rename = "outputSchema")]
    output_schema: Option<Value>,
}

struct LocalProcessHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// One upstream backend. Connection state (the spawned child, or nothing for
/// HTTP) is lazily established on first use and torn down on `shutdown`.
pub struct Backend {
    pub name: String,
    transport: Transport,
    call_timeout: Duration,
    http: Option<reqwest::Client>,
    process: Mutex<Option<LocalProcessHandle>>,
}

impl Backend {
    pub fn new(name: impl Into<String>, transport: Transport, call_timeout: Duration) -> Self {
        let http = matches!(transport, Transport::HttpStream { .. }).then(reqwest::Client::new);
        Self {
            name: name.into(),
            transport,
            call_timeout,
            http,
            process: Mutex::new(None),
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolSchema>, UpstreamError> {
        let resp = self
            .exchange(RpcRequest {
                op: "list_tools",
                tool: None,
                params: None,
            })
            .await?;

        let now = now_secs();
        Ok(resp
            .tools
            .into_iter()
            .map(|raw| ToolSchema {
                name: raw.name,
                description: raw.description,
                input_schema: raw.input_schema,
                output_schema: raw.output_schema,
                fetched_at: now,
                ttl_secs: 24 * 60 * 60,
            })
            .collect())
    }

    pub async fn call_tool(&self, tool: &str, params: &Value) -> Result<Value, UpstreamError> {
        let resp = self
            .exchange(RpcRequest {
                op: "call_tool",
                tool: Some(tool),
                params: Some(params),
            })
            .await?;

        if let Some(message) = resp.error {
            return Err(UpstreamError::BackendError {
                backend: self.name.clone(),
                message,
            });
        }
        resp.result.ok_or_else(|| UpstreamError::BackendError {
            backend: self.name.clone(),
            message: "backend returned no result and no error".into(),
        })
    }

    pub async fn shutdown(&self) {
        let mut guard = self.process.lock().await;
        if let Some(mut handle) = guard.take() {
            let _ = handle.stdin.shutdown().await;
            match tokio::time::timeout(Duration::from_secs(2), handle.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = handle.child.kill().await;
                }
            }
        }
    }

    async fn exchange(&self, req: RpcRequest<'_>) -> Result<RpcResponse, UpstreamError> {
        let timeout = self.call_timeout;
        let result = match &self.transport {
            Transport::LocalProcess { .. } => tokio::time::timeout(timeout, self.exchange_process(req)).await,
            Transport::HttpStream { .. } => tokio::time::timeout(timeout, self.exchange_http(req)).await,
        };
        result.unwrap_or(Err(UpstreamError::Timeout(timeout)))
    }

    async fn exchange_process(&self, req: RpcRequest<'_>) -> Result<RpcResponse, UpstreamError> {
        let Transport::LocalProcess { command, args } = &self.transport else {
            unreachable!()
        };

        let mut guard = self.process.lock().await;
        if guard.is_none() {
            let mut child = Command::new(command)
                .args(args)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| UpstreamError::BackendError {
                    backend: self.name.clone(),
                    message: format!("failed to spawn backend process: {e}"),
                })?;
            let stdin = child.stdin.take().ok_or_else(|| UpstreamError::BackendError {
                backend: self.name.clone(),
                message: "child process has no stdin".into(),
            })?;
            let stdout = child.stdout.take().ok_or_else(|| UpstreamError::BackendError {
                backend: self.name.clone(),
                message: "child process has no stdout".into(),
            })?;
            *guard = Some(LocalProcessHandle {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            });
        }
        let handle = guard.as_mut().expect("just ensured Some above");

        let mut line = serde_json::to_vec(&req).map_err(|e| UpstreamError::BackendError {
            backend: self.name.clone(),
            message: format!("failed to encode request: {e}"),
        })?;
        line.push(b'\n');
        handle
            .stdin
            .write_all(&line)
            .await
            .map_err(|e| UpstreamError::BackendError {
                backend: self.name.clone(),
                message: format!("failed to write to backend stdin: {e}"),
            })?;

        let mut response_line = String::new();
        let bytes_read = handle
            .stdout
            .read_line(&mut response_line)
            .await
            .map_err(|e| UpstreamError::BackendError {
                backend: self.name.clone(),
                message: format!("failed to read backend response: {e}"),
            })?;
        if bytes_read == 0 {
            *guard = None;
            return Err(UpstreamError::BackendError {
                backend: self.name.clone(),
                message: "backend process closed stdout".into(),
            });
        }

        serde_json::from_str(&response_line).map_err(|e| UpstreamError::BackendError {
            backend: self.name.clone(),
            message: format!("malformed backend response: {e}"),
        })
    }

    async fn exchange_http(&self, req: RpcRequest<'_>) -> Result<RpcResponse, UpstreamError> {
        let Transport::HttpStream { base_url, bearer_token } = &self.transport else {
            unreachable!()
        };
        let client = self.http.as_ref().expect("http client set for HttpStream transport");

        let mut builder = client.post(base_url).json(&req);
        if let Some(token) = bearer_token {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let resp = builder.send().await.map_err(|e| UpstreamError::BackendError {
            backend: self.name.clone(),
            message: format!("request failed: {e}"),
        })?;

        if !resp.status().is_success() {
            return Err(UpstreamError::BackendError {
                backend: self.name.clone(),
                message: format!("backend returned {}", resp.status()),
            });
        }

        resp.json().await.map_err(|e| UpstreamError::BackendError {
            backend: self.name.clone(),
            message: format!("malformed backend response: {e}"),
        })
    }
}
