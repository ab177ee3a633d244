//! Step types and the step registry
//!
//! A step type names one LLM-backed operation. The registry maps each step
//! type to a [`StepDefinition`]: how to build its prompt, what to return when
//! the upstream model is unavailable, and sampling overrides. Registries are
//! supplied when the engine is built, so adding a step never touches the
//! engine itself.

pub mod builtin;
pub mod output;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::PipelineContext;

pub use output::{output_schema, StepOutput};

/// Named category of LLM-backed operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    RequirementsGeneration,
    TaskGeneration,
    QualityValidation,
    ContentEnhancement,
    SimilarityMatching,
    FakeContentDetection,
    GoalDecomposition,
    AssetExtraction,
    DeliverableAssembly,
    /// Caller-registered step; its payload stays untyped JSON.
    Custom(String),
}

impl StepType {
    /// All built-in step types.
    pub fn builtin() -> Vec<StepType> {
        vec![
            StepType::RequirementsGeneration,
            StepType::TaskGeneration,
            StepType::QualityValidation,
            StepType::ContentEnhancement,
            StepType::SimilarityMatching,
            StepType::FakeContentDetection,
            StepType::GoalDecomposition,
            StepType::AssetExtraction,
            StepType::DeliverableAssembly,
        ]
    }

    pub fn as_str(&self) -> &str {
        match self {
            StepType::RequirementsGeneration => "requirements_generation",
            StepType::TaskGeneration => "task_generation",
            StepType::QualityValidation => "quality_validation",
            StepType::ContentEnhancement => "content_enhancement",
            StepType::SimilarityMatching => "similarity_matching",
            StepType::FakeContentDetection => "fake_content_detection",
            StepType::GoalDecomposition => "goal_decomposition",
            StepType::AssetExtraction => "asset_extraction",
            StepType::DeliverableAssembly => "deliverable_assembly",
            StepType::Custom(name) => name,
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = std::convert::Infallible;

    /// Unknown names become `Custom`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(StepType::builtin()
            .into_iter()
            .find(|step| step.as_str() == s)
            .unwrap_or_else(|| StepType::Custom(s.to_string())))
    }
}

/// Builds the user prompt of a step from its input and context.
pub type PromptBuilder = Arc<dyn Fn(&Value, &PipelineContext) -> String + Send + Sync>;

/// Builds the canned payload returned when upstream is unavailable.
pub type FallbackBuilder = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Prompt builder, fallback payload and sampling overrides for one step.
#[derive(Clone)]
pub struct StepDefinition {
    pub system_prompt: String,
    prompt: PromptBuilder,
    fallback: FallbackBuilder,
    pub fallback_confidence: f64,
    pub fallback_reasoning: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("system_prompt", &self.system_prompt)
            .field("fallback_confidence", &self.fallback_confidence)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl StepDefinition {
    pub fn new<P, F>(system_prompt: impl Into<String>, prompt: P, fallback: F) -> Self
    where
        P: Fn(&Value, &PipelineContext) -> String + Send + Sync + 'static,
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self {
            system_prompt: system_prompt.into(),
            prompt: Arc::new(prompt),
            fallback: Arc::new(fallback),
            fallback_confidence: 0.3,
            fallback_reasoning: "Upstream model unavailable; returned a static placeholder"
                .to_string(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Definition used for step types nobody registered.
    pub fn generic(step: &StepType) -> Self {
        let name = step.to_string();
        let fallback_name = name.clone();
        Self::new(
            "You are a business operations assistant. Always answer with a single JSON object.",
            move |input, ctx| {
                format!(
                    "Perform the '{}' operation.\n{}\nInput:\n{}\n\nRespond with a JSON object.",
                    name,
                    context_block(ctx),
                    pretty(input)
                )
            },
            move |_| {
                json!({
                    "status": "unavailable",
                    "step": fallback_name,
                    "message": "No model available for this step; retry later or supply the result manually."
                })
            },
        )
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_fallback_confidence(mut self, confidence: f64) -> Self {
        self.fallback_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_fallback_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.fallback_reasoning = reasoning.into();
        self
    }

    pub fn build_prompt(&self, input: &Value, ctx: &PipelineContext) -> String {
        (self.prompt)(input, ctx)
    }

    pub fn fallback_payload(&self, input: &Value) -> Value {
        (self.fallback)(input)
    }
}

/// Map from step type to definition.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<StepType, StepDefinition>,
}

impl StepRegistry {
    /// Empty registry; every lookup resolves to the generic definition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in step.
    pub fn with_builtin_steps() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register or replace a step, returning the previous definition.
    pub fn register(&mut self, step: StepType, def: StepDefinition) -> Option<StepDefinition> {
        self.steps.insert(step, def)
    }

    pub fn get(&self, step: &StepType) -> Option<&StepDefinition> {
        self.steps.get(step)
    }

    pub fn contains(&self, step: &StepType) -> bool {
        self.steps.contains_key(step)
    }

    /// Registered definition, or the generic one.
    pub fn resolve(&self, step: &StepType) -> StepDefinition {
        self.steps
            .get(step)
            .cloned()
            .unwrap_or_else(|| StepDefinition::generic(step))
    }

    pub fn step_types(&self) -> Vec<StepType> {
        self.steps.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Business-context lines shared by prompts.
pub(crate) fn context_block(ctx: &PipelineContext) -> String {
    let mut lines = Vec::new();
    if let Some(ws) = &ctx.workspace_id {
        lines.push(format!("Workspace: {}", ws));
    }
    if let Some(goal) = &ctx.goal_id {
        lines.push(format!("Goal: {}", goal));
    }
    if let Some(task) = &ctx.task_id {
        lines.push(format!("Task: {}", task));
    }
    lines.join("\n")
}

pub(crate) fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
