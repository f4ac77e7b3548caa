//! Process entry point: load configuration, wire up the process-wide
//! singletons (admission pool, schema cache, circuit breaker, client pool),
//! and serve the JSON-RPC surface over stdio until stdin closes.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use ptc_broker::admission::AdmissionPool;
use ptc_broker::audit::AuditLog;
use ptc_broker::circuit_breaker::CircuitBreakerConfig;
use ptc_broker::config::{self, Config};
use ptc_broker::llm::LlmProvider;
use ptc_broker::observability::create_observer;
use ptc_broker::rate_limiter::{RateLimiter, RateLimiterConfig};
use ptc_broker::rpc;
use ptc_broker::schema_cache::SchemaCache;
use ptc_broker::upstream::ClientPool;
use ptc_broker::Handler;

const UPSTREAM_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.state_dir) {
        tracing::error!(error = %e, dir = %config.state_dir.display(), "failed to create state directory");
        return ExitCode::FAILURE;
    }

    let observer = create_observer(&config.observability_backend);
    let audit_log = Arc::new(AuditLog::new(config.audit_log_path.clone()));

    let backends = match config::load_backend_specs(config.sandbox.backends_config_path.as_deref()) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to load backend pool configuration");
            return ExitCode::FAILURE;
        }
    };

    let admission_pool = Arc::new(AdmissionPool::new(
        config.admission.max_concurrent,
        config.admission.queue_size,
        config.admission.queue_timeout,
        observer.clone(),
    ));
    let schema_cache = Arc::new(SchemaCache::new(
        Default::default(),
        Some(config.state_dir.join("schema-cache.json")),
        observer.clone(),
    ));
    let client_pool = Arc::new(ClientPool::new(
        backends,
        UPSTREAM_CALL_TIMEOUT,
        CircuitBreakerConfig::default(),
        admission_pool,
        schema_cache,
        observer.clone(),
    ));
    let llm_provider = Arc::new(LlmProvider::new(config.llm.base_url.clone(), config.llm.api_key.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));

    let scratch_dir = config.state_dir.join("scratch");
    if let Err(e) = std::fs::create_dir_all(&scratch_dir) {
        tracing::error!(error = %e, dir = %scratch_dir.display(), "failed to create scratch directory");
        return ExitCode::FAILURE;
    }

    let handler = Arc::new(Handler::new(
        config.clone(),
        client_pool,
        llm_provider,
        audit_log,
        observer,
        rate_limiter,
        scratch_dir,
    ));

    tracing::info!("ptc-broker ready, serving JSON-RPC on stdio");
    if let Err(e) = rpc::serve_stdio(handler).await {
        tracing::error!(error = %e, "rpc server exited with an error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
