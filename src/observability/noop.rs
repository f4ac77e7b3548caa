//! Zero-overhead observer backend. Default when no backend is configured.

use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

pub struct NoopObserver;

impl Observer for NoopObserver {
    fn record_event(&self, _event: &ObserverEvent) {}
    fn record_metric(&self, _metric: &ObserverMetric) {}
    fn name(&self) -> &str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_noop() {
        assert_eq!(NoopObserver.name(), "noop");
    }

    #[test]
    fn record_calls_are_no_ops() {
        let obs = NoopObserver;
        obs.record_event(&ObserverEvent::CacheHit { tool: "x".into() });
        obs.record_metric(&ObserverMetric::QueueDepth(1));
        obs.flush();
        obs.shutdown();
    }
}
