//! Per-backend circuit breaker (C1): closed/open/half-open fault isolation.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::UpstreamError;
use crate::observability::{Observer, ObserverEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitBreakerStats {
    pub state: Option<CircuitState>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    opened_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Fault-isolates one upstream backend. All state reads/writes are
/// serialized by a single mutex; the wrapped call itself runs outside the
/// lock so a slow backend never blocks other callers from observing state.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    observer: std::sync::Arc<dyn Observer>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, observer: std::sync::Arc<dyn Observer>) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                total_failures: 0,
                opened_at: None,
                next_probe_at: None,
                probe_in_flight: false,
            }),
            observer,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CircuitBreakerStats {
            state: Some(inner.state),
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
        }
    }

    /// Decide whether a call may proceed right now, transitioning
    /// open→half-open if the cooldown has elapsed. Returns `Err` if the call
    /// must fail fast (open, or a half-open probe is already in flight).
    fn admit(&self) -> Result<(), UpstreamError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let ready = inner
                    .next_probe_at
                    .map(|t| Instant::now() >= t)
                    .unwrap_or(false);
                if ready {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    self.observer.record_event(&ObserverEvent::CircuitTransition {
                        backend: self.name.clone(),
                        from: "open".into(),
                        to: "half_open".into(),
                    });
                    Ok(())
                } else {
                    Err(UpstreamError::CircuitOpen {
                        backend: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(UpstreamError::CircuitOpen {
                        backend: self.name.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let from = inner.state.as_str();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.next_probe_at = None;
        inner.probe_in_flight = false;
        if from != "closed" {
            self.observer.record_event(&ObserverEvent::CircuitTransition {
                backend: self.name.clone(),
                from: from.into(),
                to: "closed".into(),
            });
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let from = inner.state.as_str();
        inner.consecutive_failures += 1;
        inner.total_failures += 1;
        inner.probe_in_flight = false;

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.next_probe_at = Some(Instant::now() + self.config.cooldown);
            if from != "open" {
                self.observer.record_event(&ObserverEvent::CircuitTransition {
                    backend: self.name.clone(),
                    from: from.into(),
                    to: "open".into(),
                });
            }
        }
    }

    /// Execute `f` through the breaker. If the circuit is open (or a
    /// half-open probe is already in flight), fails fast with
    /// `UpstreamError::CircuitOpen` without invoking `f`.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, UpstreamError>>,
    {
        self.admit()?;
        match f().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }
}
