//! Observability: model-call tracing and engine statistics
//!
//! What this module provides
//! - `TracingLayer`: wraps a model service in an `info_span!("model_call")`
//!   with the model and json mode, and logs token usage or the failure
//! - `EngineStats`: counters the engine updates after every step
//! - `StatsSnapshot`: serializable view of the counters plus live cache,
//!   circuit and limiter state
//!
//! Composition
//! - `ServiceBuilder::new().layer(TracingLayer::new()).service(provider)`

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tower::{BoxError, Layer, Service};
use tracing::{debug, info, info_span, Instrument};

use crate::provider::{ChatRequest, ChatResponse};
use crate::resilience::CircuitState;

/// Layer that adds tracing around model calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLayer;

impl TracingLayer {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone)]
pub struct Tracing<S> {
    inner: S,
}

impl<S> Layer<S> for TracingLayer {
    type Service = Tracing<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Tracing { inner }
    }
}

impl<S> Service<ChatRequest> for Tracing<S>
where
    S: Service<ChatRequest, Response = ChatResponse, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ChatResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ChatRequest) -> Self::Future {
        let span = info_span!("model_call", model = %req.model, json_mode = req.json_mode);
        let fut = self.inner.call(req);
        Box::pin(
            async move {
                match fut.await {
                    Ok(resp) => {
                        info!(
                            prompt = resp.usage.prompt_tokens,
                            completion = resp.usage.completion_tokens,
                            chars = resp.content.len(),
                            "model call done"
                        );
                        Ok(resp)
                    }
                    Err(err) => {
                        debug!(error = %err, "model call failed");
                        Err(err)
                    }
                }
            }
            .instrument(span),
        )
    }
}

/// Counters accumulated by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub fallback_uses: u64,
    pub retries: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    total_execution: Duration,
}

impl EngineStats {
    /// Account for one finished `execute_step`.
    pub fn record_result(&mut self, success: bool, elapsed: Duration) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.total_execution += elapsed;
    }

    pub fn average_execution_time(&self) -> Duration {
        match u32::try_from(self.total_requests) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total_execution / n,
            Err(_) => Duration::from_secs_f64(
                self.total_execution.as_secs_f64() / self.total_requests as f64,
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub fallback_uses: u64,
    pub retries: u64,
    pub circuit_trips: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub average_execution_time_ms: f64,
    pub cache_size: usize,
    pub circuit_state: CircuitState,
    pub requests_in_window: usize,
}

impl StatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }
}
