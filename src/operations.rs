//! Typed helpers over `execute_step`
//!
//! Each helper runs one built-in step and hands back its typed record. They
//! never fail: when the engine returns nothing usable (hard failure, plain
//! text, schema mismatch) the step's fallback payload is used as a
//! placeholder and `placeholder` is set.

use serde_json::{json, Value};
use tracing::warn;

use crate::context::PipelineContext;
use crate::engine::PipelineEngine;
use crate::steps::output::{FakeContentReport, QualityAssessment, RequirementsOutput, TasksOutput};
use crate::steps::{StepOutput, StepType};

/// Typed step value plus how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct StepValue<T> {
    pub value: T,
    pub confidence: f64,
    pub reasoning: String,
    pub fallback_used: bool,
    pub placeholder: bool,
}

async fn run_typed<T, F>(
    engine: &PipelineEngine,
    step: StepType,
    input: Value,
    ctx: &PipelineContext,
    extract: F,
) -> StepValue<T>
where
    T: Default,
    F: Fn(StepOutput) -> Option<T>,
{
    let mut ctx = ctx.clone();
    let result = engine.execute_step(&step, &input, &mut ctx, None, None).await;
    let reasoning = result.reasoning.clone();
    if let Some(value) = result.data.and_then(&extract) {
        return StepValue {
            value,
            confidence: result.confidence,
            reasoning,
            fallback_used: result.fallback_used,
            placeholder: false,
        };
    }

    warn!(step = %step, error = ?result.error, "no typed result; using placeholder");
    let def = engine.registry().resolve(&step);
    let value = StepOutput::parse(&step, def.fallback_payload(&input))
        .ok()
        .and_then(extract)
        .unwrap_or_default();
    StepValue {
        value,
        confidence: def.fallback_confidence,
        reasoning: def.fallback_reasoning,
        fallback_used: true,
        placeholder: true,
    }
}

pub async fn generate_requirements(
    engine: &PipelineEngine,
    goal: &str,
    ctx: &PipelineContext,
) -> StepValue<RequirementsOutput> {
    run_typed(
        engine,
        StepType::RequirementsGeneration,
        json!({ "goal": goal }),
        ctx,
        |out| match out {
            StepOutput::Requirements(r) => Some(r),
            _ => None,
        },
    )
    .await
}

pub async fn generate_tasks(
    engine: &PipelineEngine,
    requirement: &str,
    ctx: &PipelineContext,
) -> StepValue<TasksOutput> {
    run_typed(
        engine,
        StepType::TaskGeneration,
        json!({ "requirement": requirement }),
        ctx,
        |out| match out {
            StepOutput::Tasks(t) => Some(t),
            _ => None,
        },
    )
    .await
}

/// Score a deliverable; `content` may be any JSON document.
pub async fn validate_quality(
    engine: &PipelineEngine,
    content: &Value,
    ctx: &PipelineContext,
) -> StepValue<QualityAssessment> {
    run_typed(
        engine,
        StepType::QualityValidation,
        json!({ "content": content }),
        ctx,
        |out| match out {
            StepOutput::Quality(q) => Some(q),
            _ => None,
        },
    )
    .await
}

pub async fn detect_fake_content(
    engine: &PipelineEngine,
    content: &str,
    ctx: &PipelineContext,
) -> StepValue<FakeContentReport> {
    run_typed(
        engine,
        StepType::FakeContentDetection,
        json!({ "content": content }),
        ctx,
        |out| match out {
            StepOutput::FakeContent(f) => Some(f),
            _ => None,
        },
    )
    .await
}
