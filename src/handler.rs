//! Tool-invocation handler (C12): the top-level "execute code" operation.
//! Starts the per-execution brokers, hands the assembled preamble and
//! constraints to the sandbox supervisor (C11), and folds whatever came back
//! into one `ExecutionResult` — tearing every broker down in the order C11
//! requires regardless of which step failed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::audit::AuditLog;
use crate::broker::discovery::{self, DiscoveryState};
use crate::broker::output_stream::{self, OutputBroker};
use crate::broker::sampling::{self, SamplingState};
use crate::broker::tool_call::{self, ToolCallState};
use crate::config::Config;
use crate::dangerous_patterns;
use crate::error::{Error, ErrorKind, SandboxError};
use crate::llm::LlmProvider;
use crate::model::{Allowlist, ExecutionResult, InvocationTracker, SamplingMetrics, SamplingQuota};
use crate::observability::{Observer, ObserverEvent};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::sandbox::preamble::{self, BrokerEndpoints};
use crate::sandbox::supervisor::{Language, Permissions, SandboxSpec, Supervisor};
use crate::upstream::ClientPool;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_SAMPLING_ROUNDS: u32 = 10;
const DEFAULT_MAX_SAMPLING_TOKENS: u64 = 50_000;
const DEFAULT_SAMPLING_MODEL: &str = "claude-3-haiku-20240307";
const BROKER_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Execution-request body shared by `executeTypescript`/`executePython`.
#[derive(Debug, Default)]
pub struct ExecuteRequest {
    pub code: String,
    pub allowed_tools: Vec<String>,
    pub permissions: Permissions,
    pub timeout: Option<Duration>,
    pub enable_sampling: bool,
    pub max_sampling_rounds: Option<u32>,
    pub max_sampling_tokens: Option<u64>,
    pub allowed_sampling_models: Vec<String>,
    pub sampling_system_prompt: Option<String>,
    pub streaming: bool,
    pub skip_dangerous_pattern_check: bool,
}

pub struct Handler {
    config: Arc<Config>,
    client_pool: Arc<ClientPool>,
    llm_provider: Arc<LlmProvider>,
    audit_log: Arc<AuditLog>,
    observer: Arc<dyn Observer>,
    /// Process-wide per §5 ("Circuit breakers, admission pool, rate limiter
    /// are all process-wide singletons"); buckets are still keyed per
    /// execution id (`invoke:<id>`/`discovery:<id>`) so sharing the limiter
    /// never lets one execution's traffic starve another's.
    rate_limiter: Arc<RateLimiter>,
    scratch_dir: PathBuf,
}

impl Handler {
    pub fn new(
        config: Arc<Config>,
        client_pool: Arc<ClientPool>,
        llm_provider: Arc<LlmProvider>,
        audit_log: Arc<AuditLog>,
        observer: Arc<dyn Observer>,
        rate_limiter: Arc<RateLimiter>,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            client_pool,
            llm_provider,
            audit_log,
            observer,
            rate_limiter,
            scratch_dir,
        }
    }

    pub async fn execute(&self, language: Language, req: ExecuteRequest) -> ExecutionResult {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        if !req.skip_dangerous_pattern_check && !self.config.skip_dangerous_pattern_check {
            let matches = dangerous_patterns::scan(&req.code);
            if let Some(m) = matches.first() {
                return ExecutionResult {
                    success: false,
                    stdout: String::new(),
                    stderr: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    tools_called: Vec::new(),
                    tool_summary: Vec::new(),
                    sampling_metrics: None,
                    error: Some(format!("rejected by dangerous-pattern check: {} ({})", m.pattern, m.reason)),
                };
            }
        }

        let timeout = req.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let allowlist = Allowlist::new(req.allowed_tools.clone());

        self.observer.record_event(&ObserverEvent::ExecutionStart {
            execution_id: execution_id.clone(),
            language: format!("{language:?}"),
            allowlist_size: allowlist.as_slice().len(),
            sampling_enabled: req.enable_sampling,
        });

        // Step 2: output-stream broker. Non-critical — log and continue.
        let output_broker = Arc::new(OutputBroker::new(random_token()));
        let output_handle = match bind_and_serve(output_stream::router(output_broker.clone())).await {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::warn!(error = %e, "output-stream broker failed to bind, continuing without it");
                None
            }
        };

        // Step 3: tool-call broker (+ discovery, same port, method-routed).
        let tool_call_token = random_token();
        let discovery_token = random_token();
        let tracker = Arc::new(InvocationTracker::new());

        let tool_call_state = Arc::new(ToolCallState {
            token: tool_call_token.clone(),
            allowlist,
            execution_id: execution_id.clone(),
            rate_limiter: self.rate_limiter.clone(),
            client_pool: self.client_pool.clone(),
            tracker: tracker.clone(),
            observer: self.observer.clone(),
            call_timeout: Duration::from_millis(self.config.tool_call_timeout_ms),
        });
        let discovery_state = Arc::new(DiscoveryState {
            token: discovery_token.clone(),
            execution_id: execution_id.clone(),
            rate_limiter: self.rate_limiter.clone(),
            client_pool: self.client_pool.clone(),
            audit_log: self.audit_log.clone(),
            fanout_timeout: Duration::from_millis(self.config.discovery_timeout_ms),
        });

        let tool_router = tool_call::router(tool_call_state).merge(discovery::router(discovery_state));
        let tool_handle = match bind_and_serve(tool_router).await {
            Ok(h) => h,
            Err(e) => {
                if let Some(h) = output_handle {
                    h.shutdown().await;
                }
                return sandbox_unavailable_result(&format!("tool-call broker failed to bind: {e}"), started);
            }
        };

        // Step 4: sampling broker, only if requested.
        let quota = if req.enable_sampling {
            Some(Arc::new(SamplingQuota::new(
                req.max_sampling_rounds.unwrap_or(DEFAULT_MAX_SAMPLING_ROUNDS),
                req.max_sampling_tokens.unwrap_or(DEFAULT_MAX_SAMPLING_TOKENS),
            )))
        } else {
            None
        };

        let mut sampling_handle = None;
        let mut sampling_endpoint = None;
        if let Some(quota) = &quota {
            let sampling_token = random_token();
            let model_allowlist = if req.allowed_sampling_models.is_empty() {
                self.config.llm.model_allowlist.clone()
            } else {
                req.allowed_sampling_models.clone()
            };
            let mut system_prompt_allowlist = self.config.llm.system_prompt_allowlist.clone();
            if let Some(prompt) = &req.sampling_system_prompt {
                if !system_prompt_allowlist.iter().any(|p| p == prompt) {
                    system_prompt_allowlist.push(prompt.clone());
                }
            }
            let default_model = model_allowlist
                .first()
                .cloned()
                .unwrap_or_else(|| DEFAULT_SAMPLING_MODEL.to_string());

            let sampling_state = Arc::new(SamplingState {
                token: sampling_token.clone(),
                execution_id: execution_id.clone(),
                model_allowlist,
                system_prompt_allowlist,
                quota: quota.clone(),
                provider: self.llm_provider.clone(),
                content_filter_enabled: true,
                default_model,
                observer: self.observer.clone(),
            });

            match bind_and_serve(sampling::router(sampling_state)).await {
                Ok(h) => {
                    sampling_endpoint = Some((h.port, sampling_token));
                    sampling_handle = Some(h);
                }
                Err(e) => {
                    tool_handle.shutdown().await;
                    if let Some(h) = output_handle {
                        h.shutdown().await;
                    }
                    return sandbox_unavailable_result(&format!("sampling broker failed to bind: {e}"), started);
                }
            }
        }

        // Step 5: invoke the sandbox supervisor.
        let preamble_source = preamble::build(
            language,
            &BrokerEndpoints {
                tool_call_port: tool_handle.port,
                tool_call_token: tool_call_token.clone(),
                discovery_port: tool_handle.port,
                discovery_token: discovery_token.clone(),
                sampling: sampling_endpoint,
            },
        );

        let spec = SandboxSpec {
            language,
            code: req.code,
            preamble: preamble_source,
            timeout,
            permissions: req.permissions,
            heap_limit_mb: self.config.sandbox.heap_limit_mb,
            scratch_dir: self.scratch_dir.clone(),
            interpreter_override: None,
        };

        let supervisor = Supervisor::new(execution_id.clone(), self.audit_log.clone(), self.observer.clone());
        let outcome = supervisor.run(spec).await;

        // Step 7: tear down in the order §4.11 fixes: output stream, then
        // tool-call broker, then sampling broker.
        if let Some(h) = output_handle {
            h.shutdown().await;
        }
        tool_handle.shutdown().await;
        if let Some(h) = sampling_handle {
            h.shutdown().await;
        }

        // Step 6: fold the outcome into the execution result.
        let result = match outcome {
            Ok(o) => {
                let error = if o.success {
                    None
                } else {
                    Some(o.stderr.clone().unwrap_or_else(|| "sandboxed execution failed".to_string()))
                };
                ExecutionResult {
                    success: o.success,
                    stdout: o.stdout,
                    stderr: o.stderr,
                    duration_ms: started.elapsed().as_millis() as u64,
                    tools_called: tracker.tools_called(),
                    tool_summary: tracker.summaries(),
                    sampling_metrics: quota.as_ref().map(|q| SamplingMetrics {
                        rounds_used: q.rounds_used(),
                        tokens_used: q.tokens_used(),
                    }),
                    error,
                }
            }
            Err(e) => {
                let error: Error = e.into();
                ExecutionResult {
                    success: false,
                    stdout: String::new(),
                    stderr: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    tools_called: tracker.tools_called(),
                    tool_summary: tracker.summaries(),
                    sampling_metrics: quota.as_ref().map(|q| SamplingMetrics {
                        rounds_used: q.rounds_used(),
                        tokens_used: q.tokens_used(),
                    }),
                    error: Some(error.to_string()),
                }
            }
        };

        self.observer.record_event(&ObserverEvent::ExecutionEnd {
            execution_id,
            duration: started.elapsed(),
            success: result.success,
            tools_called: result.tools_called.len(),
        });

        result
    }
}

fn sandbox_unavailable_result(message: &str, started: Instant) -> ExecutionResult {
    let error: Error = SandboxError::SpawnFailed(message.to_string()).into();
    debug_assert_eq!(error.kind(), ErrorKind::SandboxUnavailable);
    ExecutionResult {
        success: false,
        stdout: String::new(),
        stderr: None,
        duration_ms: started.elapsed().as_millis() as u64,
        tools_called: Vec::new(),
        tool_summary: Vec::new(),
        sampling_metrics: None,
        error: Some(error.to_string()),
    }
}

/// A 32-byte random token, hex-encoded. Minted fresh per broker instance per
/// execution — never shared across brokers or reused across executions.
fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A broker bound to a random loopback port and served in the background.
/// `shutdown` signals graceful shutdown and waits (bounded) for the serve
/// task to exit; it never panics or blocks indefinitely on a wedged task.
struct RunningBroker {
    port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RunningBroker {
    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(BROKER_SHUTDOWN_GRACE, &mut self.handle).await;
        self.handle.abort();
    }
}

/// Binds `router` to a random loopback port and serves it on a background
/// task until `shutdown` is called. Returns once the listener is bound so
/// the caller can read back the assigned port immediately.
async fn bind_and_serve(router: axum::Router) -> std::io::Result<RunningBroker> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let port = listener.local_addr()?.port();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
            tracing::warn!(error = %e, "broker serve task exited with an error");
        }
    });

    Ok(RunningBroker {
        port,
        shutdown_tx: Some(shutdown_tx),
        handle,
    })
}
