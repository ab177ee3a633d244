//! Pipeline engine
//!
//! `PipelineEngine::execute_step` runs one LLM-backed step through the
//! reliability shell:
//!
//! 1. no model service configured → fallback
//! 2. circuit not admitting → fallback, or a hard failure when fallbacks are off
//! 3. cache hit → cached result
//! 4. rate limit slot, then the model call under the per-call timeout
//! 5. parse: JSON validated against the step's record, plain text wrapped as
//!    `{"response": text}`
//! 6. on error: record a breaker failure, back off `base × 2^retry` and start
//!    over from 1 until `max_retries` is spent
//!
//! The engine is a cheap `Clone` over shared state and also implements
//! `Service<StepRequest>` so it composes with other Tower stacks.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_openai::{config::OpenAIConfig, Client};
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tower::{util::BoxCloneService, BoxError, Layer, Service, ServiceBuilder, ServiceExt};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::{cache_key, ResponseCache};
use crate::config::EngineConfig;
use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::observability::{EngineStats, StatsSnapshot, TracingLayer};
use crate::provider::{ChatRequest, ChatResponse, ModelSvc, OpenAIProvider};
use crate::resilience::{
    Backoff, BreakerConfig, CircuitBreaker, CircuitState, RateLimitLayer,
    SlidingWindowLimiter, TimeoutLayer,
};
use crate::result::PipelineResult;
use crate::steps::{StepOutput, StepRegistry, StepType};

/// Confidence assumed when the model does not report one.
const DEFAULT_CONFIDENCE: f64 = 0.7;
/// Confidence of a plain-text answer.
const UNSTRUCTURED_CONFIDENCE: f64 = 0.5;
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// One step invocation, as taken by the `Service` impl.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub step: StepType,
    pub input: Value,
    pub context: PipelineContext,
    /// Replaces the registered prompt builder.
    pub custom_prompt: Option<String>,
    /// Overrides the configured default model.
    pub model: Option<String>,
}

impl StepRequest {
    pub fn new(step: StepType, input: Value) -> Self {
        Self {
            step,
            input,
            context: PipelineContext::default(),
            custom_prompt: None,
            model: None,
        }
    }

    pub fn context(mut self, context: PipelineContext) -> Self {
        self.context = context;
        self
    }

    pub fn custom_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_prompt = Some(prompt.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

struct EngineInner {
    config: EngineConfig,
    registry: StepRegistry,
    cache: Mutex<ResponseCache>,
    breaker: CircuitBreaker,
    limiter: Arc<SlidingWindowLimiter>,
    stats: Mutex<EngineStats>,
    // BoxCloneService is Send but not Sync; callers clone it out per attempt.
    model: Option<Mutex<ModelSvc>>,
    backoff: Backoff,
}

/// Reliability shell around an LLM model service.
#[derive(Clone)]
pub struct PipelineEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("config", &self.inner.config)
            .field("steps", &self.inner.registry.len())
            .field("has_model", &self.inner.model.is_some())
            .finish()
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<StepRegistry>,
    model: Option<ModelSvc>,
}

impl EngineBuilder {
    /// Use `registry` instead of the built-in steps.
    pub fn registry(mut self, registry: StepRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Call `svc` for every upstream request. The service is wrapped in
    /// [`TracingLayer`].
    pub fn model_service<S>(mut self, svc: S) -> Self
    where
        S: Service<ChatRequest, Response = ChatResponse, Error = BoxError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        self.model = Some(BoxCloneService::new(TracingLayer::new().layer(svc)));
        self
    }

    pub fn openai(self, client: Client<OpenAIConfig>) -> Self {
        self.model_service(OpenAIProvider::with_client(client))
    }

    pub fn build(self) -> Result<PipelineEngine> {
        let config = self.config;
        config.validate()?;
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: config.circuit_breaker_threshold,
            reset_timeout: config.circuit_breaker_timeout(),
        });
        let limiter = Arc::new(SlidingWindowLimiter::per_minute(
            config.max_requests_per_minute,
        ));
        let cache = ResponseCache::new(config.cache_ttl(), config.cache_max_entries);
        let backoff = Backoff::exponential(config.retry_backoff_base(), 2.0, MAX_BACKOFF);
        Ok(PipelineEngine {
            inner: Arc::new(EngineInner {
                registry: self
                    .registry
                    .unwrap_or_else(StepRegistry::with_builtin_steps),
                cache: Mutex::new(cache),
                breaker,
                limiter,
                stats: Mutex::new(EngineStats::default()),
                model: self.model.map(Mutex::new),
                backoff,
                config,
            }),
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PipelineEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            registry: None,
            model: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.inner.registry
    }

    pub fn has_model(&self) -> bool {
        self.inner.model.is_some()
    }

    /// Fresh context carrying the configured timeout and retry budget.
    pub fn context(&self) -> PipelineContext {
        self.inner.config.context()
    }

    /// Run one step. Never fails: callers branch on `result.success`.
    ///
    /// `ctx.retry_count` is advanced in place, so callers can read how many
    /// retries were spent.
    pub async fn execute_step(
        &self,
        step: &StepType,
        input: &Value,
        ctx: &mut PipelineContext,
        custom_prompt: Option<&str>,
        model: Option<&str>,
    ) -> PipelineResult {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "pipeline_step",
            step = %step,
            workspace = ctx.workspace_id.as_deref().unwrap_or("-"),
            goal = ctx.goal_id.as_deref().unwrap_or("-"),
            request_id = %request_id,
        );
        async {
            let result = self.run(step, input, ctx, custom_prompt, model).await;
            self.finish(result, step, ctx, started, request_id)
        }
        .instrument(span)
        .await
    }

    /// Owned-request form of [`execute_step`](Self::execute_step).
    pub async fn execute(&self, request: StepRequest) -> PipelineResult {
        let StepRequest {
            step,
            input,
            mut context,
            custom_prompt,
            model,
        } = request;
        self.execute_step(
            &step,
            &input,
            &mut context,
            custom_prompt.as_deref(),
            model.as_deref(),
        )
        .await
    }

    async fn run(
        &self,
        step: &StepType,
        input: &Value,
        ctx: &mut PipelineContext,
        custom_prompt: Option<&str>,
        model: Option<&str>,
    ) -> PipelineResult {
        loop {
            let Some(svc) = self.model_service() else {
                return self.fallback(step, input, "no upstream model configured");
            };

            // An unsettled probe permit is handed back when dropped (cache hit).
            let Some(permit) = self.inner.breaker.permit() else {
                if ctx.fallback_enabled {
                    return self.fallback(step, input, "circuit breaker open");
                }
                return PipelineResult::failed(
                    PipelineError::CircuitOpen.to_string(),
                    ctx.retry_count,
                );
            };

            let key = ctx.cache_enabled.then(|| cache_key(step, input, ctx));
            if let Some(key) = &key {
                let hit = lock(&self.inner.cache).get(key);
                if let Some(mut hit) = hit {
                    debug!(key = %key, "cache hit");
                    hit.cached = true;
                    return hit;
                }
            }

            match self.call_model(svc, step, input, ctx, custom_prompt, model).await {
                Ok(result) => {
                    permit.success();
                    if let Some(key) = key {
                        lock(&self.inner.cache).put(key, result.clone());
                    }
                    return result;
                }
                Err(err) => {
                    permit.failure();
                    if err.is_retryable() && ctx.can_retry() {
                        ctx.retry_count += 1;
                        lock(&self.inner.stats).retries += 1;
                        let delay = self.inner.backoff.delay_for_attempt(ctx.retry_count);
                        warn!(
                            error = %err,
                            retry = ctx.retry_count,
                            max_retries = ctx.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            "step failed; retrying"
                        );
                        sleep(delay).await;
                        continue;
                    }
                    warn!(error = %err, retries = ctx.retry_count, "step failed");
                    return PipelineResult::failed(err.to_string(), ctx.retry_count);
                }
            }
        }
    }

    async fn call_model(
        &self,
        svc: ModelSvc,
        step: &StepType,
        input: &Value,
        ctx: &PipelineContext,
        custom_prompt: Option<&str>,
        model: Option<&str>,
    ) -> Result<PipelineResult> {
        let config = &self.inner.config;
        let def = self.inner.registry.resolve(step);
        let user = match custom_prompt {
            Some(prompt) => prompt.to_string(),
            None => def.build_prompt(input, ctx),
        };
        let model = model.unwrap_or(&config.default_model).to_string();
        let req = ChatRequest {
            model: model.clone(),
            system: def.system_prompt.clone(),
            user,
            temperature: def.temperature.unwrap_or(config.default_temperature),
            max_tokens: def.max_tokens.unwrap_or(config.default_max_tokens),
            json_mode: true,
        };

        // The limiter sits outside the timeout: waiting for a slot is not call time.
        let call: Pin<Box<dyn Future<Output = std::result::Result<ChatResponse, BoxError>> + Send>> =
            Box::pin(
                ServiceBuilder::new()
                    .layer(RateLimitLayer::new(self.inner.limiter.clone()))
                    .layer(TimeoutLayer::new(ctx.timeout))
                    .service(svc)
                    .oneshot(req),
            );
        let resp = call.await.map_err(PipelineError::from_boxed)?;

        {
            let mut stats = lock(&self.inner.stats);
            stats.prompt_tokens += u64::from(resp.usage.prompt_tokens);
            stats.completion_tokens += u64::from(resp.usage.completion_tokens);
        }

        Ok(interpret(step, &resp.content).with_meta("model", model))
    }

    fn fallback(&self, step: &StepType, input: &Value, reason: &str) -> PipelineResult {
        let def = self.inner.registry.resolve(step);
        let payload = def.fallback_payload(input);
        let data = StepOutput::parse(step, payload.clone()).unwrap_or(StepOutput::Json(payload));
        info!(reason, "using fallback");
        let mut result =
            PipelineResult::succeeded(data, def.fallback_reasoning.clone(), def.fallback_confidence)
                .with_meta("fallback_reason", reason);
        result.fallback_used = true;
        result
    }

    fn finish(
        &self,
        mut result: PipelineResult,
        step: &StepType,
        ctx: &PipelineContext,
        started: Instant,
        request_id: Uuid,
    ) -> PipelineResult {
        result.execution_time = started.elapsed();
        result.retry_count = ctx.retry_count;
        result
            .metadata
            .insert("request_id".into(), request_id.to_string().into());
        result
            .metadata
            .insert("completed_at".into(), chrono::Utc::now().to_rfc3339().into());
        result
            .metadata
            .insert("step_type".into(), step.as_str().into());

        {
            let mut stats = lock(&self.inner.stats);
            stats.record_result(result.success, result.execution_time);
            if result.cached {
                stats.cache_hits += 1;
            }
            if result.fallback_used {
                stats.fallback_uses += 1;
            }
        }
        info!(
            success = result.success,
            cached = result.cached,
            fallback = result.fallback_used,
            retries = result.retry_count,
            elapsed_ms = result.execution_time.as_millis() as u64,
            "step finished"
        );
        result
    }

    fn model_service(&self) -> Option<ModelSvc> {
        self.inner.model.as_ref().map(|svc| lock(svc).clone())
    }

    /// Snapshot of the counters. Does not wait on callers parked in the
    /// rate limiter.
    pub fn stats(&self) -> StatsSnapshot {
        let requests_in_window = self.inner.limiter.in_window();
        let stats = lock(&self.inner.stats).clone();
        StatsSnapshot {
            total_requests: stats.total_requests,
            successful_requests: stats.successful_requests,
            failed_requests: stats.failed_requests,
            cache_hits: stats.cache_hits,
            fallback_uses: stats.fallback_uses,
            retries: stats.retries,
            circuit_trips: self.inner.breaker.trips(),
            prompt_tokens: stats.prompt_tokens,
            completion_tokens: stats.completion_tokens,
            average_execution_time_ms: stats.average_execution_time().as_secs_f64() * 1000.0,
            cache_size: lock(&self.inner.cache).len(),
            circuit_state: self.inner.breaker.state(),
            requests_in_window,
        }
    }

    pub fn clear_cache(&self) {
        lock(&self.inner.cache).clear();
        info!("cache cleared");
    }

    pub fn reset_circuit(&self) {
        self.inner.breaker.reset();
        info!("circuit reset");
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }
}

/// Turn raw model text into a result: typed record, raw JSON on a schema
/// mismatch, or wrapped text when the answer is not JSON at all.
fn interpret(step: &StepType, content: &str) -> PipelineResult {
    let value = match serde_json::from_str::<Value>(content) {
        Ok(value) => value,
        Err(_) => {
            debug!(chars = content.len(), "unstructured model response");
            return PipelineResult::succeeded(
                StepOutput::Unstructured {
                    response: content.to_string(),
                },
                "Model returned unstructured text".to_string(),
                UNSTRUCTURED_CONFIDENCE,
            )
            .with_meta("schema_valid", false);
        }
    };

    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_CONFIDENCE);
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Generated {} with the upstream model", step));

    match StepOutput::parse(step, value.clone()) {
        Ok(output) => {
            PipelineResult::succeeded(output, reasoning, confidence).with_meta("schema_valid", true)
        }
        Err(err) => {
            warn!(error = %err, "model response does not match the step schema");
            PipelineResult::succeeded(StepOutput::Json(value), reasoning, confidence)
                .with_meta("schema_valid", false)
                .with_meta("schema_error", err.to_string())
        }
    }
}

impl Service<StepRequest> for PipelineEngine {
    type Response = PipelineResult;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<PipelineResult, Infallible>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: StepRequest) -> Self::Future {
        let engine = self.clone();
        Box::pin(async move { Ok(engine.execute(req).await) })
    }
}
