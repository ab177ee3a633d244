//! End-to-end behavior of the pipeline engine against scripted providers.
//!
//! All tests run on a paused tokio clock, so backoff sleeps, rate-limit waits
//! and cache expiry are deterministic.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::{advance, Instant};
use tower_llm_pipeline::{
    CircuitState, ConfigBuilder, EngineConfig, PipelineContext, PipelineEngine, PipelineResult,
    ScriptedProvider, ServiceExt, StepDefinition, StepOutput, StepRegistry, StepRequest, StepType,
};

const TASKS: &str = r#"{"tasks": [{"name": "Write brief", "priority": "high"}], "confidence": 0.85, "reasoning": "derived from goal"}"#;

fn engine(config: EngineConfig, provider: &ScriptedProvider) -> PipelineEngine {
    PipelineEngine::builder(config)
        .model_service(provider.clone())
        .build()
        .unwrap()
}

async fn run(engine: &PipelineEngine, step: StepType, input: Value, ctx: &mut PipelineContext) -> PipelineResult {
    engine.execute_step(&step, &input, ctx, None, None).await
}

fn fresh_ctx() -> PipelineContext {
    PipelineContext::for_workspace("ws-1").goal("goal-1")
}

// ===== Cache =====

#[tokio::test(start_paused = true)]
async fn identical_requests_are_served_from_cache() {
    let provider = ScriptedProvider::new().always_reply(TASKS);
    let engine = engine(EngineConfig::default(), &provider);
    let input = json!({"requirement": "Landing page"});

    let first = run(&engine, StepType::TaskGeneration, input.clone(), &mut fresh_ctx()).await;
    let second = run(&engine, StepType::TaskGeneration, input, &mut fresh_ctx()).await;

    assert!(first.success && !first.cached);
    assert!(second.success && second.cached);
    assert_eq!(first.payload(), second.payload());
    assert_eq!(provider.calls(), 1);
    assert_ne!(first.metadata["request_id"], second.metadata["request_id"]);
    assert_eq!(engine.stats().cache_hits, 1);
}

#[tokio::test(start_paused = true)]
async fn reordered_input_keys_hit_the_same_entry() {
    let provider = ScriptedProvider::new().always_reply(TASKS);
    let engine = engine(EngineConfig::default(), &provider);
    let a: Value = serde_json::from_str(r#"{"requirement": "x", "budget": {"max": 5, "min": 1}}"#).unwrap();
    let b: Value = serde_json::from_str(r#"{"budget": {"min": 1, "max": 5}, "requirement": "x"}"#).unwrap();

    run(&engine, StepType::TaskGeneration, a, &mut fresh_ctx()).await;
    let second = run(&engine, StepType::TaskGeneration, b, &mut fresh_ctx()).await;
    assert!(second.cached);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cache_entry_expires_after_ttl() {
    let provider = ScriptedProvider::new().always_reply(TASKS);
    let config = ConfigBuilder::new().cache_ttl(Duration::from_secs(10)).build();
    let engine = engine(config, &provider);
    let input = json!({"requirement": "x"});

    run(&engine, StepType::TaskGeneration, input.clone(), &mut fresh_ctx()).await;
    advance(Duration::from_secs(9)).await;
    assert!(run(&engine, StepType::TaskGeneration, input.clone(), &mut fresh_ctx()).await.cached);

    advance(Duration::from_millis(1001)).await;
    let after = run(&engine, StepType::TaskGeneration, input, &mut fresh_ctx()).await;
    assert!(!after.cached);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn cache_can_be_disabled_per_call_and_cleared() {
    let provider = ScriptedProvider::new().always_reply(TASKS);
    let engine = engine(EngineConfig::default(), &provider);
    let input = json!({"requirement": "x"});

    let mut no_cache = fresh_ctx().cache(false);
    run(&engine, StepType::TaskGeneration, input.clone(), &mut no_cache).await;
    run(&engine, StepType::TaskGeneration, input.clone(), &mut no_cache).await;
    assert_eq!(provider.calls(), 2);
    assert_eq!(engine.stats().cache_size, 0);

    run(&engine, StepType::TaskGeneration, input.clone(), &mut fresh_ctx()).await;
    assert_eq!(engine.stats().cache_size, 1);
    engine.clear_cache();
    let again = run(&engine, StepType::TaskGeneration, input, &mut fresh_ctx()).await;
    assert!(!again.cached);
    assert_eq!(provider.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn cache_is_scoped_by_goal() {
    let provider = ScriptedProvider::new().always_reply(TASKS);
    let engine = engine(EngineConfig::default(), &provider);
    let input = json!({"requirement": "x"});

    run(&engine, StepType::TaskGeneration, input.clone(), &mut fresh_ctx()).await;
    let mut other_goal = PipelineContext::for_workspace("ws-1").goal("goal-2");
    let r = run(&engine, StepType::TaskGeneration, input, &mut other_goal).await;
    assert!(!r.cached);
    assert_eq!(provider.calls(), 2);
}

// ===== Parsing =====

#[tokio::test(start_paused = true)]
async fn typed_payload_carries_model_confidence_and_reasoning() {
    let provider = ScriptedProvider::new().always_reply(TASKS);
    let engine = engine(EngineConfig::default(), &provider);
    let r = run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx()).await;

    match r.data {
        Some(StepOutput::Tasks(ref tasks)) => assert_eq!(tasks.tasks[0].name, "Write brief"),
        ref other => panic!("unexpected payload {other:?}"),
    }
    assert_eq!(r.confidence, 0.85);
    assert_eq!(r.reasoning, "derived from goal");
    assert_eq!(r.metadata["schema_valid"], true);
    assert_eq!(r.metadata["model"], "gpt-4o-mini");
    assert_eq!(r.metadata["step_type"], "task_generation");
    assert!(r.metadata["completed_at"].as_str().unwrap().contains('T'));
}

#[tokio::test(start_paused = true)]
async fn plain_text_answer_is_wrapped_not_failed() {
    let provider = ScriptedProvider::new().always_reply("Sure! Here are some ideas.");
    let engine = engine(EngineConfig::default(), &provider);
    let r = run(&engine, StepType::ContentEnhancement, json!({}), &mut fresh_ctx()).await;

    assert!(r.success);
    assert!(!r.fallback_used);
    assert_eq!(r.payload(), json!({"response": "Sure! Here are some ideas."}));
    assert_eq!(r.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn schema_mismatch_keeps_raw_json() {
    let provider = ScriptedProvider::new().always_reply(r#"{"goals": ["a", "b"]}"#);
    let engine = engine(EngineConfig::default(), &provider);
    let r = run(&engine, StepType::GoalDecomposition, json!({}), &mut fresh_ctx()).await;

    assert!(r.success);
    assert_eq!(r.data, Some(StepOutput::Json(json!({"goals": ["a", "b"]}))));
    assert_eq!(r.metadata["schema_valid"], false);
}

// ===== Retries =====

#[tokio::test(start_paused = true)]
async fn permanent_failure_retries_with_exponential_backoff() {
    let provider = ScriptedProvider::new().always_fail("upstream exploded");
    let config = ConfigBuilder::new().circuit_breaker_threshold(10).build();
    let engine = engine(config, &provider);
    let mut ctx = fresh_ctx().max_retries(3);

    let started = Instant::now();
    let r = run(&engine, StepType::TaskGeneration, json!({}), &mut ctx).await;
    let elapsed = started.elapsed();

    assert!(!r.success);
    assert!(r.data.is_none());
    assert_eq!(r.error(), Some("upstream exploded"));
    assert_eq!(r.retry_count, 3);
    assert_eq!(ctx.retry_count, 3);
    assert_eq!(provider.calls(), 4);
    // 2 + 4 + 8 seconds of backoff
    assert!(elapsed >= Duration::from_secs(14), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(15), "{elapsed:?}");

    let stats = engine.stats();
    assert_eq!(stats.retries, 3);
    assert_eq!(stats.failed_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_on_retry() {
    let provider = ScriptedProvider::new().fail("blip").always_reply(TASKS);
    let engine = engine(EngineConfig::default(), &provider);
    let started = Instant::now();
    let r = run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx()).await;

    assert!(r.success);
    assert_eq!(r.retry_count, 1);
    assert_eq!(provider.calls(), 2);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn upstream_rate_limit_errors_are_retried() {
    let provider = ScriptedProvider::new()
        .rate_limited("429 too many requests")
        .always_reply(TASKS);
    let engine = engine(EngineConfig::default(), &provider);
    let r = run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx()).await;
    assert!(r.success);
    assert_eq!(r.retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_upstream_times_out_and_is_retried() {
    let provider = ScriptedProvider::new()
        .always_reply(TASKS)
        .with_latency(Duration::from_secs(40));
    let engine = engine(EngineConfig::default(), &provider);
    let mut ctx = fresh_ctx().timeout(Duration::from_secs(5)).max_retries(1);

    let r = run(&engine, StepType::TaskGeneration, json!({}), &mut ctx).await;
    assert!(!r.success);
    assert_eq!(r.retry_count, 1);
    assert!(r.error().unwrap().contains("timed out"), "{:?}", r.error());
    assert_eq!(provider.calls(), 2);
}

// ===== Circuit breaker =====

fn breaker_config(threshold: u32) -> EngineConfig {
    ConfigBuilder::new()
        .circuit_breaker_threshold(threshold)
        .circuit_breaker_timeout(Duration::from_secs(60))
        .build()
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_after_threshold_and_serves_fallback() {
    let provider = ScriptedProvider::new().always_fail("down");
    let engine = engine(breaker_config(2), &provider);

    for _ in 0..2 {
        let r = run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx().max_retries(0)).await;
        assert!(!r.success);
    }
    assert_eq!(engine.circuit_state(), CircuitState::Open);

    let r = run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx()).await;
    assert!(r.success);
    assert!(r.fallback_used);
    assert_eq!(provider.calls(), 2);
    assert_eq!(engine.stats().circuit_trips, 1);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_without_fallback_fails_immediately() {
    let provider = ScriptedProvider::new().always_fail("down");
    let engine = engine(breaker_config(1), &provider);
    run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx().max_retries(0)).await;

    let started = Instant::now();
    let mut ctx = fresh_ctx().fallback(false);
    let r = run(&engine, StepType::TaskGeneration, json!({}), &mut ctx).await;
    assert!(!r.success);
    assert_eq!(r.error(), Some("circuit breaker is open"));
    assert_eq!(r.retry_count, 0);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn breaker_opening_mid_retry_switches_to_fallback() {
    let provider = ScriptedProvider::new().always_fail("down");
    let engine = engine(breaker_config(2), &provider);
    let mut ctx = fresh_ctx().max_retries(3);

    let r = run(&engine, StepType::GoalDecomposition, json!({"goal": "Hire"}), &mut ctx).await;
    assert!(r.success);
    assert!(r.fallback_used);
    assert_eq!(r.retry_count, 2);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn half_open_success_closes_the_circuit() {
    let provider = ScriptedProvider::new().fail("down").fail("down").always_reply(TASKS);
    let engine = engine(breaker_config(2), &provider);
    for _ in 0..2 {
        run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx().max_retries(0)).await;
    }
    assert_eq!(engine.circuit_state(), CircuitState::Open);

    advance(Duration::from_secs(60)).await;
    let r = run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx()).await;
    assert!(r.success);
    assert!(!r.fallback_used);
    assert_eq!(engine.circuit_state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_reopens_the_circuit() {
    let provider = ScriptedProvider::new().always_fail("down");
    let engine = engine(breaker_config(2), &provider);
    for _ in 0..2 {
        run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx().max_retries(0)).await;
    }

    advance(Duration::from_secs(60)).await;
    let probe = run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx().max_retries(0)).await;
    assert!(!probe.success);
    assert_eq!(engine.circuit_state(), CircuitState::Open);
    assert_eq!(provider.calls(), 3);

    let blocked = run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx()).await;
    assert!(blocked.fallback_used);
    assert_eq!(provider.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn cached_probe_does_not_wedge_half_open() {
    let provider = ScriptedProvider::new().reply(TASKS).always_fail("down");
    let engine = engine(breaker_config(1), &provider);
    let cached_input = json!({"requirement": "cached"});

    run(&engine, StepType::TaskGeneration, cached_input.clone(), &mut fresh_ctx()).await;
    run(&engine, StepType::TaskGeneration, json!({"requirement": "other"}), &mut fresh_ctx().max_retries(0)).await;
    assert_eq!(engine.circuit_state(), CircuitState::Open);

    advance(Duration::from_secs(60)).await;
    let hit = run(&engine, StepType::TaskGeneration, cached_input, &mut fresh_ctx()).await;
    assert!(hit.cached);
    assert_eq!(engine.circuit_state(), CircuitState::HalfOpen);

    // the released probe lets the next caller through to upstream
    let next = run(&engine, StepType::TaskGeneration, json!({"requirement": "new"}), &mut fresh_ctx().max_retries(0)).await;
    assert!(!next.fallback_used);
    assert_eq!(provider.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn probe_parked_in_rate_limiter_stays_the_only_probe() {
    let provider = ScriptedProvider::new().reply(TASKS).fail("down").always_reply(TASKS);
    let config = ConfigBuilder::new()
        .max_requests_per_minute(2)
        .circuit_breaker_threshold(1)
        .circuit_breaker_timeout(Duration::from_secs(10))
        .build();
    let engine = engine(config, &provider);

    run(&engine, StepType::TaskGeneration, json!({"requirement": "a"}), &mut fresh_ctx()).await;
    run(&engine, StepType::TaskGeneration, json!({"requirement": "b"}), &mut fresh_ctx().max_retries(0)).await;
    assert_eq!(engine.circuit_state(), CircuitState::Open);

    advance(Duration::from_secs(10)).await;
    // window is full until t=60, so the probe waits for a slot
    let probe = tokio::spawn({
        let engine = engine.clone();
        async move {
            let mut ctx = fresh_ctx().max_retries(0);
            engine
                .execute_step(&StepType::TaskGeneration, &json!({"requirement": "c"}), &mut ctx, None, None)
                .await
        }
    });
    tokio::task::yield_now().await;
    assert_eq!(engine.circuit_state(), CircuitState::HalfOpen);

    // well past the cooldown, the parked probe still holds half-open
    advance(Duration::from_secs(20)).await;
    let other = run(&engine, StepType::TaskGeneration, json!({"requirement": "d"}), &mut fresh_ctx()).await;
    assert!(other.fallback_used);
    assert_eq!(provider.calls(), 2);

    let probe = probe.await.unwrap();
    assert!(probe.success && !probe.fallback_used);
    assert_eq!(engine.circuit_state(), CircuitState::Closed);
    assert_eq!(provider.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn reset_circuit_restores_upstream_calls() {
    let provider = ScriptedProvider::new().fail("down").always_reply(TASKS);
    let engine = engine(breaker_config(1), &provider);
    run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx().max_retries(0)).await;
    assert_eq!(engine.circuit_state(), CircuitState::Open);

    engine.reset_circuit();
    let r = run(&engine, StepType::TaskGeneration, json!({}), &mut fresh_ctx()).await;
    assert!(r.success && !r.fallback_used);
}

// ===== Rate limiting =====

#[tokio::test(start_paused = true)]
async fn third_call_waits_for_the_window_with_two_per_minute() {
    let provider = ScriptedProvider::new().always_reply(TASKS);
    let config = ConfigBuilder::new().max_requests_per_minute(2).build();
    let engine = engine(config, &provider);

    let mut results = Vec::new();
    for i in 0..3 {
        let mut ctx = fresh_ctx();
        results.push(run(&engine, StepType::TaskGeneration, json!({"n": i}), &mut ctx).await);
    }

    assert!(results.iter().all(|r| r.success));
    assert!(results[0].execution_time < Duration::from_secs(1));
    assert!(results[1].execution_time < Duration::from_secs(1));
    assert!(results[2].execution_time >= Duration::from_secs(59), "{:?}", results[2].execution_time);
    assert_eq!(provider.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_the_limit() {
    let provider = ScriptedProvider::new().always_reply(TASKS);
    let config = ConfigBuilder::new().max_requests_per_minute(2).build();
    let engine = engine(config, &provider);
    let started = Instant::now();

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut ctx = fresh_ctx();
                engine
                    .execute_step(&StepType::TaskGeneration, &json!({"n": i}), &mut ctx, None, None)
                    .await
            })
        })
        .collect();
    for h in handles {
        assert!(h.await.unwrap().success);
    }
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(engine.stats().requests_in_window, 1);
}

#[tokio::test(start_paused = true)]
async fn stats_do_not_wait_for_parked_callers() {
    let provider = ScriptedProvider::new().always_reply(TASKS);
    let config = ConfigBuilder::new().max_requests_per_minute(1).build();
    let engine = engine(config, &provider);
    run(&engine, StepType::TaskGeneration, json!({"n": 0}), &mut fresh_ctx()).await;

    let parked = tokio::spawn({
        let engine = engine.clone();
        async move {
            let mut ctx = fresh_ctx();
            engine
                .execute_step(&StepType::TaskGeneration, &json!({"n": 1}), &mut ctx, None, None)
                .await
        }
    });
    tokio::task::yield_now().await;
    assert!(!parked.is_finished());

    let before = Instant::now();
    let stats = engine.stats();
    assert_eq!(before.elapsed(), Duration::ZERO);
    assert_eq!(stats.requests_in_window, 1);
    assert_eq!(stats.total_requests, 1);

    let late = parked.await.unwrap();
    assert!(late.success);
    assert!(late.execution_time >= Duration::from_secs(60), "{:?}", late.execution_time);
}

#[tokio::test(start_paused = true)]
async fn cache_hit_takes_no_rate_limit_slot() {
    let provider = ScriptedProvider::new().always_reply(TASKS);
    let config = ConfigBuilder::new().max_requests_per_minute(2).build();
    let engine = engine(config, &provider);

    let first = run(&engine, StepType::TaskGeneration, json!({"a": 1}), &mut fresh_ctx()).await;
    let repeat = run(&engine, StepType::TaskGeneration, json!({"a": 1}), &mut fresh_ctx()).await;
    let other = run(&engine, StepType::TaskGeneration, json!({"a": 2}), &mut fresh_ctx()).await;

    assert!(!first.cached);
    assert!(repeat.cached);
    assert!(!other.cached);
    for r in [&first, &repeat, &other] {
        assert!(r.execution_time < Duration::from_secs(1), "{:?}", r.execution_time);
    }
    assert_eq!(provider.calls(), 2);
    assert_eq!(engine.stats().requests_in_window, 2);
}

// ===== Fallbacks =====

#[tokio::test]
async fn every_builtin_step_has_a_typed_fallback() {
    let engine = PipelineEngine::builder(EngineConfig::default()).build().unwrap();
    for step in StepType::builtin() {
        let r = run(&engine, step.clone(), json!({"goal": "Grow", "content": "draft"}), &mut fresh_ctx()).await;
        assert!(r.success, "{step}");
        assert!(r.fallback_used, "{step}");
        assert!(r.confidence < 0.5, "{step}");
        assert!(r.data.as_ref().is_some_and(StepOutput::is_typed), "{step}");
        assert_eq!(r.metadata["fallback_reason"], "no upstream model configured");
    }
    let stats = engine.stats();
    assert_eq!(stats.fallback_uses, StepType::builtin().len() as u64);
    assert_eq!(stats.successful_requests, stats.total_requests);
}

// ===== Registry, overrides and Service =====

#[tokio::test]
async fn custom_prompt_and_model_reach_the_provider() {
    let provider = ScriptedProvider::new().always_reply(TASKS);
    let engine = engine(EngineConfig::default(), &provider);
    let mut ctx = fresh_ctx();
    engine
        .execute_step(&StepType::TaskGeneration, &json!({}), &mut ctx, Some("just list tasks"), Some("gpt-4o"))
        .await;

    let req = &provider.requests()[0];
    assert_eq!(req.user, "just list tasks");
    assert_eq!(req.model, "gpt-4o");
    assert!(req.json_mode);
}

#[tokio::test]
async fn registered_custom_step_is_dispatched() {
    let provider = ScriptedProvider::new().always_reply(r#"{"score": 42}"#);
    let mut registry = StepRegistry::with_builtin_steps();
    let step = StepType::Custom("lead_scoring".into());
    registry.register(
        step.clone(),
        StepDefinition::new("Score leads.", |input, _| format!("Score {}", input["lead"]), |_| json!({"score": 0}))
            .with_temperature(0.0),
    );
    let engine = PipelineEngine::builder(EngineConfig::default())
        .registry(registry)
        .model_service(provider.clone())
        .build()
        .unwrap();

    let r = run(&engine, step, json!({"lead": "acme"}), &mut fresh_ctx()).await;
    assert_eq!(r.payload(), json!({"score": 42}));
    let req = &provider.requests()[0];
    assert_eq!(req.user, "Score \"acme\"");
    assert_eq!(req.system, "Score leads.");
    assert_eq!(req.temperature, 0.0);
}

#[tokio::test]
async fn engine_is_a_tower_service() {
    let provider = ScriptedProvider::new().always_reply(TASKS);
    let engine = engine(EngineConfig::default(), &provider);
    let request = StepRequest::new(StepType::TaskGeneration, json!({"requirement": "x"}))
        .context(fresh_ctx())
        .model("gpt-4o");

    let r = engine.clone().oneshot(request).await.unwrap();
    assert!(r.success);
    assert_eq!(r.metadata["model"], "gpt-4o");
}
