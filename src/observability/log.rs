//! Tracing-based observer that emits structured log events.
//!
//! Uses the existing `tracing` infrastructure so broker events appear
//! alongside normal application logs, with no extra dependencies.

use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

pub struct LogObserver;

impl Observer for LogObserver {
    #[allow(clippy::cognitive_complexity)] // exhaustive match over event variants
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::ExecutionStart {
                execution_id,
                language,
                allowlist_size,
                sampling_enabled,
            } => {
                tracing::info!(
                    execution_id,
                    language,
                    allowlist_size,
                    sampling_enabled,
                    "observer: execution.start"
                );
            }
            ObserverEvent::ExecutionEnd {
                execution_id,
                duration,
                success,
                tools_called,
            } => {
                tracing::info!(
                    execution_id,
                    duration_ms = duration.as_millis() as u64,
                    success,
                    tools_called,
                    "observer: execution.end"
                );
            }
            ObserverEvent::ToolCallStart { tool, execution_id } => {
                tracing::info!(tool, execution_id, "observer: tool_call.start");
            }
            ObserverEvent::ToolCallEnd {
                tool,
                execution_id,
                duration,
                success,
                error_message,
            } => {
                tracing::info!(
                    tool,
                    execution_id,
                    duration_ms = duration.as_millis() as u64,
                    success,
                    error = error_message.as_deref().unwrap_or(""),
                    "observer: tool_call.end"
                );
            }
            ObserverEvent::DiscoveryRequest {
                execution_id,
                search_terms,
                results_count,
            } => {
                tracing::info!(
                    execution_id,
                    search_terms = ?search_terms,
                    results_count,
                    "observer: discovery.request"
                );
            }
            ObserverEvent::SamplingRoundStart {
                execution_id,
                model,
                streaming,
            } => {
                tracing::info!(
                    execution_id,
                    model,
                    streaming,
                    "observer: sampling_round.start"
                );
            }
            ObserverEvent::SamplingRoundEnd {
                execution_id,
                duration,
                success,
                input_tokens,
                output_tokens,
            } => {
                tracing::info!(
                    execution_id,
                    duration_ms = duration.as_millis() as u64,
                    success,
                    input_tokens = input_tokens.unwrap_or(0),
                    output_tokens = output_tokens.unwrap_or(0),
                    "observer: sampling_round.end"
                );
            }
            ObserverEvent::CircuitTransition { backend, from, to } => {
                tracing::warn!(backend, from, to, "observer: circuit.transition");
            }
            ObserverEvent::SandboxSpawn {
                execution_id,
                language,
            } => {
                tracing::info!(execution_id, language, "observer: sandbox.spawn");
            }
            ObserverEvent::SandboxExit {
                execution_id,
                exit_success,
                timed_out,
            } => {
                tracing::info!(
                    execution_id,
                    exit_success,
                    timed_out,
                    "observer: sandbox.exit"
                );
            }
            ObserverEvent::CacheHit { tool } => {
                tracing::debug!(tool, "observer: cache.hit");
            }
            ObserverEvent::CacheMiss { tool } => {
                tracing::debug!(tool, "observer: cache.miss");
            }
            ObserverEvent::Error { component, message } => {
                tracing::warn!(component, error = message.as_str(), "observer: error");
            }
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            ObserverMetric::QueueDepth(n) => {
                tracing::debug!(queue_depth = n, "observer: metric.queue_depth");
            }
            ObserverMetric::ActiveExecutions(n) => {
                tracing::debug!(active_executions = n, "observer: metric.active_executions");
            }
            ObserverMetric::AdmissionLatency(d) => {
                tracing::debug!(
                    latency_ms = d.as_millis() as u64,
                    "observer: metric.admission_latency"
                );
            }
            ObserverMetric::TokensUsed(n) => {
                tracing::debug!(tokens = n, "observer: metric.tokens_used");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn name_is_log() {
        assert_eq!(LogObserver.name(), "log");
    }

    #[test]
    fn record_event_does_not_panic() {
        let obs = LogObserver;
        obs.record_event(&ObserverEvent::ExecutionStart {
            execution_id: "e-1".into(),
            language: "python".into(),
            allowlist_size: 1,
            sampling_enabled: true,
        });
        obs.record_event(&ObserverEvent::CircuitTransition {
            backend: "fs".into(),
            from: "closed".into(),
            to: "open".into(),
        });
        obs.record_event(&ObserverEvent::Error {
            component: "cache".into(),
            message: "disk write failed".into(),
        });
    }

    #[test]
    fn record_metric_does_not_panic() {
        let obs = LogObserver;
        obs.record_metric(&ObserverMetric::QueueDepth(4));
        obs.record_metric(&ObserverMetric::AdmissionLatency(Duration::from_millis(12)));
    }

    #[test]
    fn flush_does_not_panic() {
        LogObserver.flush();
    }
}
