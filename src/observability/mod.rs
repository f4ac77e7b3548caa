//! Observability subsystem: trait-based event and metric recording.
//!
//! Provides a pluggable [`Observer`] trait with two backends:
//!
//! | Backend | Description |
//! |---------|-------------|
//! | `noop`  | Zero overhead, discards everything (default) |
//! | `log`   | Emits structured events via `tracing` |
//!
//! [`create_observer`] builds the right backend from the configured name.

mod log;
mod noop;
pub mod traits;

pub use self::log::LogObserver;
pub use self::noop::NoopObserver;
pub use self::traits::{Observer, ObserverEvent, ObserverMetric};

/// Create an observer from a backend name. Unknown or empty names fall back
/// to [`NoopObserver`] rather than failing startup.
pub fn create_observer(backend: &str) -> std::sync::Arc<dyn Observer> {
    match backend {
        "log" => std::sync::Arc::new(LogObserver),
        _ => std::sync::Arc::new(NoopObserver),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_returns_noop_for_none() {
        assert_eq!(create_observer("none").name(), "noop");
    }

    #[test]
    fn factory_returns_noop_for_empty() {
        assert_eq!(create_observer("").name(), "noop");
    }

    #[test]
    fn factory_returns_noop_for_unknown() {
        assert_eq!(create_observer("prometheus").name(), "noop");
    }

    #[test]
    fn factory_returns_log_for_log() {
        assert_eq!(create_observer("log").name(), "log");
    }
}
