//! Core observer trait and event/metric types for the broker plane.

use std::time::Duration;

/// Provider-agnostic observer for broker lifecycle events and metrics.
///
/// Implementations can log to tracing, export to a metrics backend, or do
/// nothing at all. Components record events at key lifecycle points and the
/// observer decides what to do with them.
///
/// Thread-safe and cheaply cloneable behind `Arc<dyn Observer>`.
pub trait Observer: Send + Sync {
    fn record_event(&self, event: &ObserverEvent);

    fn record_metric(&self, metric: &ObserverMetric);

    /// Flush any buffered data. No-op by default.
    fn flush(&self) {}

    /// Shut down the observer backend. Default implementation calls `flush()`.
    fn shutdown(&self) {
        self.flush();
    }

    /// Human-readable backend name (e.g. "noop", "log").
    fn name(&self) -> &str;
}

/// Discrete lifecycle events the broker plane can emit.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// A top-level execution (C12) started.
    ExecutionStart {
        execution_id: String,
        language: String,
        allowlist_size: usize,
        sampling_enabled: bool,
    },

    /// A top-level execution finished.
    ExecutionEnd {
        execution_id: String,
        duration: Duration,
        success: bool,
        tools_called: usize,
    },

    /// A tool call (C7) is about to start.
    ToolCallStart { tool: String, execution_id: String },

    /// A tool call (C7) finished.
    ToolCallEnd {
        tool: String,
        execution_id: String,
        duration: Duration,
        success: bool,
        error_message: Option<String>,
    },

    /// A discovery request (C8) was served.
    DiscoveryRequest {
        execution_id: String,
        search_terms: Vec<String>,
        results_count: usize,
    },

    /// A sampling round (C9) started.
    SamplingRoundStart {
        execution_id: String,
        model: String,
        streaming: bool,
    },

    /// A sampling round (C9) finished.
    SamplingRoundEnd {
        execution_id: String,
        duration: Duration,
        success: bool,
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
    },

    /// A circuit breaker (C1) changed state.
    CircuitTransition {
        backend: String,
        from: String,
        to: String,
    },

    /// The sandbox supervisor (C11) spawned a child process.
    SandboxSpawn { execution_id: String, language: String },

    /// The sandbox child process exited.
    SandboxExit {
        execution_id: String,
        exit_success: bool,
        timed_out: bool,
    },

    /// A schema cache (C4) lookup hit.
    CacheHit { tool: String },

    /// A schema cache (C4) lookup missed and triggered a fetch.
    CacheMiss { tool: String },

    /// An error occurred in a component.
    Error { component: String, message: String },
}

/// Numeric metric samples.
#[derive(Debug, Clone)]
pub enum ObserverMetric {
    /// Current admission queue depth (C2, gauge).
    QueueDepth(u64),
    /// Current number of in-flight executions (gauge).
    ActiveExecutions(u64),
    /// Time spent waiting for an admission permit (histogram-style).
    AdmissionLatency(Duration),
    /// Tokens consumed in a sampling round (C9).
    TokensUsed(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_variants_are_constructible() {
        let _ = ObserverEvent::ExecutionStart {
            execution_id: "e-1".into(),
            language: "typescript".into(),
            allowlist_size: 3,
            sampling_enabled: false,
        };
        let _ = ObserverEvent::ExecutionEnd {
            execution_id: "e-1".into(),
            duration: Duration::from_millis(120),
            success: true,
            tools_called: 2,
        };
        let _ = ObserverEvent::ToolCallStart {
            tool: "prefix__fs__read_file".into(),
            execution_id: "e-1".into(),
        };
        let _ = ObserverEvent::ToolCallEnd {
            tool: "prefix__fs__read_file".into(),
            execution_id: "e-1".into(),
            duration: Duration::from_millis(5),
            success: true,
            error_message: None,
        };
        let _ = ObserverEvent::DiscoveryRequest {
            execution_id: "e-1".into(),
            search_terms: vec!["file".into()],
            results_count: 2,
        };
        let _ = ObserverEvent::SamplingRoundStart {
            execution_id: "e-1".into(),
            model: "claude-3-opus".into(),
            streaming: false,
        };
        let _ = ObserverEvent::SamplingRoundEnd {
            execution_id: "e-1".into(),
            duration: Duration::from_millis(800),
            success: true,
            input_tokens: Some(100),
            output_tokens: Some(50),
        };
        let _ = ObserverEvent::CircuitTransition {
            backend: "fs".into(),
            from: "closed".into(),
            to: "open".into(),
        };
        let _ = ObserverEvent::SandboxSpawn {
            execution_id: "e-1".into(),
            language: "typescript".into(),
        };
        let _ = ObserverEvent::SandboxExit {
            execution_id: "e-1".into(),
            exit_success: true,
            timed_out: false,
        };
        let _ = ObserverEvent::CacheHit {
            tool: "prefix__fs__read_file".into(),
        };
        let _ = ObserverEvent::CacheMiss {
            tool: "prefix__fs__read_file".into(),
        };
        let _ = ObserverEvent::Error {
            component: "sandbox".into(),
            message: "spawn failed".into(),
        };
    }

    #[test]
    fn metric_variants_are_constructible() {
        let _ = ObserverMetric::QueueDepth(3);
        let _ = ObserverMetric::ActiveExecutions(1);
        let _ = ObserverMetric::AdmissionLatency(Duration::from_millis(10));
        let _ = ObserverMetric::TokensUsed(500);
    }
}
