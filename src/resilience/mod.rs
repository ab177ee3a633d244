//! Resilience primitives: backoff, timeout, rate limit, circuit breaker
//!
//! What this module provides
//! - `Backoff`: fixed or exponential delays for the engine's retry loop
//! - `TimeoutLayer`: bounds a model call; elapsed calls fail with `PipelineError::Timeout`
//! - `SlidingWindowLimiter` + `RateLimitLayer`: per-minute request ceiling in front of the model
//! - `CircuitBreaker`: closed/open/half-open gate consulted by the engine
//!
//! Composition
//! - The engine stacks `RateLimitLayer` outside `TimeoutLayer`, so time spent waiting
//!   for a rate-limit slot does not count against the call timeout:
//!   `ServiceBuilder::new().layer(RateLimitLayer::new(limiter)).layer(TimeoutLayer::new(dur)).service(model)`
//! - The breaker is not a layer: the engine consults it before the cache, and
//!   records outcomes only after a whole attempt (limit + call + parse).
//!
//! All timing uses `tokio::time`, so tests drive it with a paused clock.

pub mod breaker;
pub mod rate_limit;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::timeout;
use tower::{BoxError, Layer, Service};

use crate::error::PipelineError;

pub use breaker::{Admission, BreakerConfig, CircuitBreaker, CircuitState, Permit};
pub use rate_limit::{RateLimitLayer, RateLimited, SlidingWindowLimiter};

// ===== Backoff =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            initial: delay,
            factor: 1.0,
            max: delay,
        }
    }

    pub fn exponential(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial,
            factor,
            max,
        }
    }

    /// `initial × factor^attempt`, capped at `max`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.initial,
            BackoffKind::Exponential => {
                let mult = self.factor.powi(attempt as i32);
                let secs = self.initial.as_secs_f64() * mult;
                if !secs.is_finite() || secs >= self.max.as_secs_f64() {
                    self.max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

// ===== Timeout =====

pub struct TimeoutLayer {
    dur: Duration,
}

impl TimeoutLayer {
    pub fn new(dur: Duration) -> Self {
        Self { dur }
    }
}

#[derive(Clone)]
pub struct Timeout<S> {
    inner: S,
    dur: Duration,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            dur: self.dur,
        }
    }
}

impl<S, Req> Service<Req> for Timeout<S>
where
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let fut = self.inner.call(req);
        let dur = self.dur;
        Box::pin(async move {
            match timeout(dur, fut).await {
                Ok(r) => r,
                Err(_) => Err::<S::Response, BoxError>(Box::new(PipelineError::Timeout {
                    seconds: dur.as_secs_f64(),
                })),
            }
        })
    }
}
