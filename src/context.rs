//! Per-call pipeline context
//!
//! Identifies the logical request (workspace, goal, task) and carries the
//! per-call reliability toggles. A context is owned by one `execute_step`
//! call and never persisted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity and toggles for one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    pub workspace_id: Option<String>,
    pub goal_id: Option<String>,
    pub task_id: Option<String>,
    /// Retries already spent on this call; advanced by the engine.
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout: Duration,
    pub cache_enabled: bool,
    pub fallback_enabled: bool,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self {
            workspace_id: None,
            goal_id: None,
            task_id: None,
            retry_count: 0,
            max_retries: 3,
            timeout: Duration::from_secs(30),
            cache_enabled: true,
            fallback_enabled: true,
        }
    }
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context scoped to a workspace.
    pub fn for_workspace(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: Some(workspace_id.into()),
            ..Self::default()
        }
    }

    pub fn goal(mut self, goal_id: impl Into<String>) -> Self {
        self.goal_id = Some(goal_id.into());
        self
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    /// Whether another retry is permitted.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
