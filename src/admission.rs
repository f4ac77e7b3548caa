//! Admission pool & FIFO queue (C2): bounds concurrent upstream calls.
//!
//! Waiters are woken by a paired one-shot channel + deadline timer, never by
//! polling — a polling-based queue caused FIFO violations and listener
//! leaks in an earlier design (§9) and must not be reintroduced.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};

use crate::error::UpstreamError;
use crate::observability::{Observer, ObserverEvent, ObserverMetric};

struct Waiter {
    id: u64,
    tx: oneshot::Sender<bool>,
}

struct State {
    active: usize,
    waiters: VecDeque<Waiter>,
}

pub struct AdmissionPool {
    max_concurrent: usize,
    queue_max: usize,
    queue_timeout: Duration,
    state: Mutex<State>,
    draining: AtomicBool,
    drain_notify: Notify,
    next_id: AtomicU64,
    observer: Arc<dyn Observer>,
}

/// Held for the duration of one upstream call. Releases the slot on drop,
/// regardless of whether the call completed, was dropped by a timeout race,
/// or panicked.
pub struct Permit<'a> {
    pool: &'a AdmissionPool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}

impl AdmissionPool {
    pub fn new(
        max_concurrent: usize,
        queue_max: usize,
        queue_timeout: Duration,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            max_concurrent,
            queue_max,
            queue_timeout,
            state: Mutex::new(State {
                active: 0,
                waiters: VecDeque::new(),
            }),
            draining: AtomicBool::new(false),
            drain_notify: Notify::new(),
            next_id: AtomicU64::new(0),
            observer,
        }
    }

    pub fn active(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).active
    }

    pub fn queue_depth(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .waiters
            .len()
    }

    /// Acquire an admission permit, waiting in FIFO order if the pool is at
    /// capacity. Returns `Expired` if `queue_timeout` elapses first,
    /// `QueueFull` if the waiter list is already at capacity, or `Draining`
    /// if the pool has begun shutting down.
    pub async fn acquire(&self) -> Result<Permit<'_>, UpstreamError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(UpstreamError::Draining);
        }

        let rx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.active < self.max_concurrent {
                state.active += 1;
                None
            } else if state.waiters.len() >= self.queue_max {
                return Err(UpstreamError::QueueFull);
            } else {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter { id, tx });
                self.observer
                    .record_metric(&ObserverMetric::QueueDepth(state.waiters.len() as u64));
                Some((id, rx))
            }
        };

        let Some((id, rx)) = rx else {
            return Ok(Permit { pool: self });
        };

        match tokio::time::timeout(self.queue_timeout, rx).await {
            Ok(Ok(true)) => Ok(Permit { pool: self }),
            Ok(Ok(false)) => Err(UpstreamError::Draining),
            Ok(Err(_)) => Err(UpstreamError::Draining),
            Err(_) => {
                // Timed out: remove our own entry so it doesn't linger in
                // the queue (timer cancellation paired with listener removal).
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.waiters.retain(|w| w.id != id);
                Err(UpstreamError::Expired(self.queue_timeout))
            }
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let next = state.waiters.pop_front();
        match next {
            Some(waiter) => {
                // Active count is unchanged: the slot transfers directly to
                // the dequeued waiter.
                let _ = waiter.tx.send(true);
            }
            None => {
                state.active = state.active.saturating_sub(1);
                if state.active == 0 {
                    self.drain_notify.notify_waiters();
                }
            }
        }
    }

    /// Begin draining: reject all queued waiters immediately and deny new
    /// admission. Waits event-driven (no polling) until `active == 0` or
    /// `timeout` elapses.
    pub async fn drain(&self, timeout: Duration) {
        self.draining.store(true, Ordering::SeqCst);
        let (already_empty, rejected) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let rejected: Vec<Waiter> = state.waiters.drain(..).collect();
            (state.active == 0, rejected)
        };
        for waiter in rejected {
            let _ = waiter.tx.send(false);
        }
        if already_empty {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.drain_notify.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopObserver;
    use std::sync::Arc;

    fn pool(max: usize, queue_max: usize, timeout_ms: u64) -> Arc<AdmissionPool> {
        Arc::new(AdmissionPool::new(
            max,
            queue_max,
            Duration::from_millis(timeout_ms),
            Arc::new(NoopObserver),
        ))
    }

    #[tokio::test]
    async fn acquire_succeeds_under_capacity() {
        let p = pool(2, 10, 1000);
        let permit = p.acquire().await.unwrap();
        assert_eq!(p.active(), 1);
        drop(permit);
        assert_eq!(p.active(), 0);
    }

    #[tokio::test]
    async fn queue_full_rejects_immediately() {
        let p = pool(1, 0, 1000);
        let _permit = p.acquire().await.unwrap();
        let r = p.acquire().await;
        assert!(matches!(r, Err(UpstreamError::QueueFull)));
    }

    #[tokio::test]
    async fn queued_waiter_expires_after_timeout() {
        let p = pool(1, 10, 50);
        let permit = p.acquire().await.unwrap();

        let start = tokio::time::Instant::now();
        let r = p.acquire().await;
        assert!(matches!(r, Err(UpstreamError::Expired(_))));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(p.queue_depth(), 0, "expired waiter must be removed from queue");

        drop(permit);
    }

    #[tokio::test]
    async fn release_wakes_waiter_in_fifo_order() {
        let p = pool(1, 10, 5000);
        let permit = p.acquire().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let p2 = p.clone();
            let order2 = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = p2.acquire().await.unwrap();
                order2.lock().unwrap().push(i);
            }));
            // Ensure enqueue order matches spawn order.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(permit);
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn draining_rejects_new_admission() {
        let p = pool(1, 10, 1000);
        let _permit = p.acquire().await.unwrap();
        p.drain(Duration::from_millis(50)).await;

        let r = p.acquire().await;
        assert!(matches!(r, Err(UpstreamError::Draining)));
    }

    #[tokio::test]
    async fn draining_rejects_queued_waiters() {
        let p = pool(1, 10, 5000);
        let permit = p.acquire().await.unwrap();

        let p2 = p.clone();
        let waiter = tokio::spawn(async move { p2.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        p.drain(Duration::from_millis(50)).await;
        let r = waiter.await.unwrap();
        assert!(matches!(r, Err(UpstreamError::Draining)));
        drop(permit);
    }

    #[tokio::test]
    async fn drain_returns_once_active_reaches_zero() {
        let p = pool(1, 10, 1000);
        let permit = p.acquire().await.unwrap();
        let p2 = p.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(permit);
        });

        let start = tokio::time::Instant::now();
        p2.drain(Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(p2.active(), 0);
    }
}
