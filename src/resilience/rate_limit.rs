//! Sliding-window rate limiter
//!
//! Keeps the instants of admitted calls from the last window. A caller that
//! finds the window full sleeps until the oldest entry ages out.
//!
//! Two locks: an async admission lock held for the whole of `acquire` (two
//! callers can never share the last slot, and waiters are served in arrival
//! order), and a short-lived std lock around the timestamp log. The log lock
//! is never held across an await, so `in_window` answers at once even while
//! a caller is parked waiting for a slot.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::debug;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    admission: tokio::sync::Mutex<()>,
    log: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// Limiter admitting `max_per_minute` calls per 60 second window.
    pub fn per_minute(max_per_minute: usize) -> Self {
        Self::new(max_per_minute, DEFAULT_WINDOW)
    }

    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            admission: tokio::sync::Mutex::new(()),
            log: Mutex::new(VecDeque::with_capacity(max_requests.max(1))),
        }
    }

    fn log(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for a free slot and take it. Returns how long the caller waited.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        let _turn = self.admission.lock().await;
        loop {
            let wait = {
                let mut log = self.log();
                let now = Instant::now();
                prune(&mut log, now, self.window);
                if log.len() < self.max_requests {
                    log.push_back(now);
                    return started.elapsed();
                }
                let oldest = log.front().copied().unwrap_or(now);
                let wait = self.window.saturating_sub(now.duration_since(oldest));
                debug!(
                    wait_ms = wait.as_millis() as u64,
                    in_window = log.len(),
                    "rate limit reached; waiting for a slot"
                );
                wait
            };
            sleep(wait).await;
        }
    }

    /// Calls admitted within the current window. Never waits.
    pub fn in_window(&self) -> usize {
        let mut log = self.log();
        prune(&mut log, Instant::now(), self.window);
        log.len()
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }
}

fn prune(log: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = log.front() {
        if now.duration_since(*front) >= window {
            log.pop_front();
        } else {
            break;
        }
    }
}

/// Layer that takes a limiter slot before every call to the inner service.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<SlidingWindowLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<SlidingWindowLimiter>) -> Self {
        Self { limiter }
    }
}

#[derive(Clone)]
pub struct RateLimited<S> {
    inner: S,
    limiter: Arc<SlidingWindowLimiter>,
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimited<S>;
    fn layer(&self, inner: S) -> Self::Service {
        RateLimited {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

impl<S, Req> Service<Req> for RateLimited<S>
where
    Req: Send + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        // Readiness of the inner service is awaited after the slot is taken.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let limiter = self.limiter.clone();
        Box::pin(async move {
            limiter.acquire().await;
            inner.oneshot(req).await
        })
    }
}
