//! Upstream client pool (C5): owns every backend connection and fans
//! tool-discovery and tool-call traffic through C1 (circuit breaker), C2
//! (admission pool), and C4 (schema cache).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::admission::AdmissionPool;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{CacheError, UpstreamError};
use crate::model::ToolId;
use crate::observability::Observer;
use crate::schema_cache::SchemaCache;
use crate::upstream::backend::{Backend, Transport};

pub struct BackendSpec {
    pub name: String,
    pub transport: Transport,
}

struct Entry {
    backend: Arc<Backend>,
    breaker: Arc<CircuitBreaker>,
}

pub struct ClientPool {
    backends: HashMap<String, Entry>,
    admission: Arc<AdmissionPool>,
    schema_cache: Arc<SchemaCache>,
    observer: Arc<dyn Observer>,
}

impl ClientPool {
    pub fn new(
        specs: Vec<BackendSpec>,
        call_timeout: Duration,
        breaker_config: CircuitBreakerConfig,
        admission: Arc<AdmissionPool>,
        schema_cache: Arc<SchemaCache>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let backends = specs
            .into_iter()
            .map(|spec| {
                let backend = Arc::new(Backend::new(spec.name.clone(), spec.transport, call_timeout));
                let breaker = Arc::new(CircuitBreaker::new(spec.name.clone(), breaker_config, observer.clone()));
                (spec.name, Entry { backend, breaker })
            })
            .collect();

        Self {
            backends,
            admission,
            schema_cache,
            observer,
        }
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Fan out `list_tools` to every backend in parallel. A single backend's
    /// failure is logged and excluded from the result rather than failing
    /// the whole listing.
    pub async fn list_all_tool_schemas(&self) -> Vec<crate::model::ToolSchema> {
        let fetches = self.backends.values().map(|entry| {
            let backend = entry.backend.clone();
            let breaker = entry.breaker.clone();
            async move { breaker.execute(|| async { backend.list_tools().await }).await }
        });

        let results = futures::future::join_all(fetches).await;
        let mut schemas = Vec::new();
        for result in results {
            match result {
                Ok(backend_schemas) => {
                    for schema in backend_schemas {
                        self.schema_cache.put(schema.clone());
                        schemas.push(schema);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "backend tool listing failed, omitting its tools");
                }
            }
        }
        schemas
    }

    /// Fetch a single tool's schema, coalesced per tool id through C4.
    pub async fn get_tool_schema(&self, tool_id: &ToolId) -> Result<crate::model::ToolSchema, CacheError> {
        let entry = self.entry_for(tool_id).map_err(|e| CacheError::FetchFailed {
            name: tool_id.as_str().into(),
            source: Box::new(e),
        })?;
        let tool_name = tool_id.as_str().to_string();
        let backend = entry.backend.clone();
        let breaker = entry.breaker.clone();
        let wanted = tool_name.clone();

        self.schema_cache
            .get_or_fetch(&tool_name, move || async move {
                let schemas = breaker
                    .execute(|| async { backend.list_tools().await })
                    .await
                    .map_err(|e| CacheError::FetchFailed {
                        name: wanted.clone(),
                        source: Box::new(e),
                    })?;
                schemas
                    .into_iter()
                    .find(|s| s.name == wanted)
                    .ok_or_else(|| CacheError::FetchFailed {
                        name: wanted.clone(),
                        source: "tool not advertised by backend".into(),
                    })
            })
            .await
    }

    /// Invoke a tool: admission-gated, circuit-broken, routed by backend.
    pub async fn call_tool(&self, tool_id: &ToolId, params: &Value) -> Result<Value, UpstreamError> {
        let entry = self.entry_for(tool_id)?;
        let permit = self.admission.acquire().await?;
        let tool_name = tool_id.as_str();
        let result = entry
            .breaker
            .execute(|| async { entry.backend.call_tool(tool_name, params).await })
            .await;
        drop(permit);
        result
    }

    fn entry_for(&self, tool_id: &ToolId) -> Result<&Entry, UpstreamError> {
        self.backends
            .get(tool_id.backend())
            .ok_or_else(|| UpstreamError::UnknownBackend(tool_id.as_str().to_string()))
    }

    pub async fn shutdown(&self) {
        for entry in self.backends.values() {
            entry.backend.shutdown().await;
        }
    }
}
