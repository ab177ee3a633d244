//! Typed step payloads
//!
//! Every built-in step has a record describing the JSON the model is asked to
//! return. Upstream JSON is validated against it once, at the parse boundary,
//! so callers never dig through loosely typed maps.
//!
//! Primary collections are required; everything else defaults, so a model
//! that omits a secondary field still produces a valid record.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StepType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Requirement {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RequirementsOutput {
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub estimated_effort_hours: Option<f64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub assigned_role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TasksOutput {
    pub tasks: Vec<GeneratedTask>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QualityAssessment {
    /// 0.0 – 1.0
    pub score: f64,
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EnhancedContent {
    pub content: String,
    #[serde(default)]
    pub changes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SimilarityMatch {
    pub candidate_id: String,
    pub score: f64,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SimilarityOutput {
    pub matches: Vec<SimilarityMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FakeContentReport {
    pub is_fake: bool,
    #[serde(default)]
    pub fake_score: f64,
    #[serde(default)]
    pub indicators: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SubGoal {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub target_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GoalDecompositionOutput {
    pub sub_goals: Vec<SubGoal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedAsset {
    pub name: String,
    #[serde(default)]
    pub asset_type: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AssetExtractionOutput {
    pub assets: Vec<ExtractedAsset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeliverableSection {
    pub heading: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeliverableOutput {
    pub title: String,
    #[serde(default)]
    pub executive_summary: String,
    #[serde(default)]
    pub sections: Vec<DeliverableSection>,
}

fn default_priority() -> String {
    "medium".to_string()
}

/// Payload of a pipeline result, one variant per built-in step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StepOutput {
    Requirements(RequirementsOutput),
    Tasks(TasksOutput),
    Quality(QualityAssessment),
    Enhancement(EnhancedContent),
    Similarity(SimilarityOutput),
    FakeContent(FakeContentReport),
    Goals(GoalDecompositionOutput),
    Assets(AssetExtractionOutput),
    Deliverable(DeliverableOutput),
    /// Valid JSON for a custom step, or JSON that did not match the step's record.
    Json(Value),
    /// The model did not answer with JSON.
    Unstructured { response: String },
}

impl StepOutput {
    /// Validate a decoded JSON document against the record of `step`.
    pub fn parse(step: &StepType, value: Value) -> Result<StepOutput, serde_json::Error> {
        Ok(match step {
            StepType::RequirementsGeneration => Self::Requirements(serde_json::from_value(value)?),
            StepType::TaskGeneration => Self::Tasks(serde_json::from_value(value)?),
            StepType::QualityValidation => Self::Quality(serde_json::from_value(value)?),
            StepType::ContentEnhancement => Self::Enhancement(serde_json::from_value(value)?),
            StepType::SimilarityMatching => Self::Similarity(serde_json::from_value(value)?),
            StepType::FakeContentDetection => Self::FakeContent(serde_json::from_value(value)?),
            StepType::GoalDecomposition => Self::Goals(serde_json::from_value(value)?),
            StepType::AssetExtraction => Self::Assets(serde_json::from_value(value)?),
            StepType::DeliverableAssembly => Self::Deliverable(serde_json::from_value(value)?),
            StepType::Custom(_) => Self::Json(value),
        })
    }

    /// Untagged JSON form of the payload, as the model produced it.
    pub fn to_value(&self) -> Value {
        let value = match self {
            Self::Requirements(v) => serde_json::to_value(v),
            Self::Tasks(v) => serde_json::to_value(v),
            Self::Quality(v) => serde_json::to_value(v),
            Self::Enhancement(v) => serde_json::to_value(v),
            Self::Similarity(v) => serde_json::to_value(v),
            Self::FakeContent(v) => serde_json::to_value(v),
            Self::Goals(v) => serde_json::to_value(v),
            Self::Assets(v) => serde_json::to_value(v),
            Self::Deliverable(v) => serde_json::to_value(v),
            Self::Json(v) => return v.clone(),
            Self::Unstructured { response } => {
                return serde_json::json!({ "response": response });
            }
        };
        value.unwrap_or_default()
    }

    /// True when the payload matched its step's record.
    pub fn is_typed(&self) -> bool {
        !matches!(self, Self::Json(_) | Self::Unstructured { .. })
    }
}

/// JSON schema of the record a step expects, embedded in its prompt.
pub fn output_schema(step: &StepType) -> Option<Value> {
    let schema = match step {
        StepType::RequirementsGeneration => schemars::schema_for!(RequirementsOutput),
        StepType::TaskGeneration => schemars::schema_for!(TasksOutput),
        StepType::QualityValidation => schemars::schema_for!(QualityAssessment),
        StepType::ContentEnhancement => schemars::schema_for!(EnhancedContent),
        StepType::SimilarityMatching => schemars::schema_for!(SimilarityOutput),
        StepType::FakeContentDetection => schemars::schema_for!(FakeContentReport),
        StepType::GoalDecomposition => schemars::schema_for!(GoalDecompositionOutput),
        StepType::AssetExtraction => schemars::schema_for!(AssetExtractionOutput),
        StepType::DeliverableAssembly => schemars::schema_for!(DeliverableOutput),
        StepType::Custom(_) => return None,
    };
    serde_json::to_value(&schema).ok()
}
