//! Shared data-model types (§3): tool identifiers, schemas, allowlists,
//! invocation tracking, and the execution result.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A tool identifier of the shape `prefix__server__tool`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolId(String);

impl ToolId {
    pub const PREFIX: &'static str = "prefix";

    /// Parse and validate a raw tool identifier string.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, "__");
        let prefix = parts.next()?;
        let server = parts.next()?;
        let tool = parts.next()?;
        if prefix != Self::PREFIX {
            return None;
        }
        if server.is_empty()
            || !server
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return None;
        }
        if tool.is_empty()
            || !tool
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The backend (`server`) component of the identifier.
    pub fn backend(&self) -> &str {
        self.0.splitn(3, "__").nth(1).unwrap_or_default()
    }
}

impl std::fmt::Display for ToolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cached tool schema (C4 entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
    pub output_schema: Option<serde_json::Value>,
    pub fetched_at: u64,
    pub ttl_secs: u64,
}

impl ToolSchema {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.fetched_at.saturating_add(self.ttl_secs)
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// An ordered, de-duplicated set of tool identifiers permitted for one
/// execution. Immutable once constructed.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    ordered: Vec<String>,
}

impl Allowlist {
    pub fn new(tools: impl IntoIterator<Item = String>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let ordered = tools.into_iter().filter(|t| seen.insert(t.clone())).collect();
        Self { ordered }
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.ordered.iter().any(|t| t == tool)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.ordered
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// One recorded tool invocation within an execution.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRecord {
    pub tool_name: String,
    pub started_at: u64,
    pub duration_ms: u64,
    pub status: InvocationStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Ok,
    Error,
}

/// Aggregate of invocations for one tool within an execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvocationSummary {
    pub tool_name: String,
    pub call_count: u64,
    pub ok_count: u64,
    pub err_count: u64,
    pub total_duration_ms: u64,
    pub last_status: Option<InvocationStatus>,
    pub last_error: Option<String>,
    pub last_called_at: Option<u64>,
}

/// Tracks invocations for the lifetime of one execution. Owned by the
/// tool-call broker instance; dies with the execution.
#[derive(Debug, Default)]
pub struct InvocationTracker {
    inner: std::sync::Mutex<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    calls: Vec<InvocationRecord>,
    summaries: HashMap<String, InvocationSummary>,
}

impl InvocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: InvocationRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let summary = inner
            .summaries
            .entry(record.tool_name.clone())
            .or_insert_with(|| InvocationSummary {
                tool_name: record.tool_name.clone(),
                ..Default::default()
            });
        summary.call_count += 1;
        match record.status {
            InvocationStatus::Ok => summary.ok_count += 1,
            InvocationStatus::Error => summary.err_count += 1,
        }
        summary.total_duration_ms += record.duration_ms;
        summary.last_status = Some(record.status);
        summary.last_error = record.error_message.clone();
        summary.last_called_at = Some(record.started_at);
        inner.calls.push(record);
    }

    /// Flat, temporally-ordered list of tool names called (duplicates preserved).
    pub fn tools_called(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.calls.iter().map(|c| c.tool_name.clone()).collect()
    }

    pub fn summaries(&self) -> Vec<InvocationSummary> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.summaries.values().cloned().collect()
    }
}

/// Per-execution sampling quota (C9).
#[derive(Debug)]
pub struct SamplingQuota {
    pub max_rounds: u32,
    pub max_tokens: u64,
    inner: std::sync::Mutex<SamplingQuotaInner>,
}

#[derive(Debug, Default)]
struct SamplingQuotaInner {
    rounds_used: u32,
    tokens_used: u64,
}

impl SamplingQuota {
    pub fn new(max_rounds: u32, max_tokens: u64) -> Self {
        Self {
            max_rounds,
            max_tokens,
            inner: std::sync::Mutex::new(SamplingQuotaInner::default()),
        }
    }

    /// Atomically check-and-increment the round counter. Returns `false`
    /// (quota not consumed) if the round would exceed `max_rounds`.
    pub fn try_consume_round(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.rounds_used >= self.max_rounds {
            return false;
        }
        inner.rounds_used += 1;
        true
    }

    /// Precondition check: would committing `tokens` more exceed the quota?
    pub fn would_exceed_tokens(&self, tokens: u64) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tokens_used.saturating_add(tokens) > self.max_tokens
    }

    /// Commit token usage after a round completes. Returns `false` if this
    /// would exceed quota; the caller must roll back the round in that case.
    pub fn commit_tokens(&self, tokens: u64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.tokens_used.saturating_add(tokens) > self.max_tokens {
            return false;
        }
        inner.tokens_used += tokens;
        true
    }

    pub fn rollback_round(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.rounds_used = inner.rounds_used.saturating_sub(1);
    }

    pub fn rounds_used(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).rounds_used
    }

    pub fn tokens_used(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).tokens_used
    }
}

/// Final result of one top-level execution (C12 output, §3).
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: Option<String>,
    pub duration_ms: u64,
    pub tools_called: Vec<String>,
    pub tool_summary: Vec<InvocationSummary>,
    pub sampling_metrics: Option<SamplingMetrics>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SamplingMetrics {
    pub rounds_used: u32,
    pub tokens_used: u64,
}
