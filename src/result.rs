//! Result types for pipeline execution

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::steps::StepOutput;

/// The outcome of one `execute_step` invocation.
///
/// Callers branch on `success`; a fallback result is successful but carries
/// `fallback_used` and a lower confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Whether the step produced a usable payload
    pub success: bool,
    /// Step payload, absent on hard failure
    pub data: Option<StepOutput>,
    /// Human-readable explanation of how the payload was obtained
    pub reasoning: String,
    /// 0.0 – 1.0
    pub confidence: f64,
    /// Error message if the step failed
    pub error: Option<String>,
    pub execution_time: Duration,
    pub cached: bool,
    pub fallback_used: bool,
    pub retry_count: u32,
    pub metadata: Map<String, Value>,
}

impl PipelineResult {
    pub(crate) fn succeeded(data: StepOutput, reasoning: String, confidence: f64) -> Self {
        Self {
            success: true,
            data: Some(data),
            reasoning,
            confidence: confidence.clamp(0.0, 1.0),
            error: None,
            execution_time: Duration::ZERO,
            cached: false,
            fallback_used: false,
            retry_count: 0,
            metadata: Map::new(),
        }
    }

    pub(crate) fn failed(error: impl Into<String>, retry_count: u32) -> Self {
        let error = error.into();
        Self {
            success: false,
            data: None,
            reasoning: format!("Step failed: {}", error),
            confidence: 0.0,
            error: Some(error),
            execution_time: Duration::ZERO,
            cached: false,
            fallback_used: false,
            retry_count,
            metadata: Map::new(),
        }
    }

    /// Check if the step was successful
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Get the error if the step failed
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Untagged JSON payload; `Null` when there is none.
    pub fn payload(&self) -> Value {
        self.data.as_ref().map(StepOutput::to_value).unwrap_or(Value::Null)
    }

    pub(crate) fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}
