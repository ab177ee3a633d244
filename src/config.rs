//! Configuration for the pipeline engine
//!
//! Engine-wide knobs (rate limit, breaker, cache, model defaults). Per-call
//! toggles live on [`PipelineContext`](crate::context::PipelineContext).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};

/// Engine-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Requests admitted per sliding 60 second window
    pub max_requests_per_minute: usize,

    /// Recorded failures before the circuit opens
    pub circuit_breaker_threshold: u32,

    /// Cooldown after the last failure before a probe is admitted
    pub circuit_breaker_timeout_seconds: u64,

    /// Maximum age of a cached result
    pub cache_ttl_seconds: u64,

    /// Entry count above which expired entries are swept
    pub cache_max_entries: usize,

    /// Base of the exponential retry backoff, in milliseconds
    pub retry_backoff_base_ms: u64,

    /// Default model to use
    pub default_model: String,

    /// Default temperature for generation
    pub default_temperature: f32,

    /// Default max tokens
    pub default_max_tokens: u32,

    /// Per-call timeout seeded into new contexts
    pub default_timeout_seconds: u64,

    /// Retry budget seeded into new contexts
    pub default_max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 50,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_seconds: 60,
            cache_ttl_seconds: 3600,
            cache_max_entries: 1000,
            retry_backoff_base_ms: 1000,
            default_model: "gpt-4o-mini".to_string(),
            default_temperature: 0.3,
            default_max_tokens: 2000,
            default_timeout_seconds: 30,
            default_max_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    /// New context with this configuration's timeout and retry budget.
    pub fn context(&self) -> PipelineContext {
        PipelineContext::new()
            .timeout(self.default_timeout())
            .max_retries(self.default_max_retries)
    }

    /// Reject values that would make the engine unusable.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests_per_minute == 0 {
            return Err(PipelineError::Config {
                message: "max_requests_per_minute must be at least 1".to_string(),
            });
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(PipelineError::Config {
                message: "circuit_breaker_threshold must be at least 1".to_string(),
            });
        }
        if self.default_timeout_seconds == 0 {
            return Err(PipelineError::Config {
                message: "default_timeout_seconds must be at least 1".to_string(),
            });
        }
        if self.default_model.trim().is_empty() {
            return Err(PipelineError::Config {
                message: "default_model must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: EngineConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn max_requests_per_minute(mut self, max: usize) -> Self {
        self.config.max_requests_per_minute = max;
        self
    }

    pub fn circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker_threshold = threshold;
        self
    }

    pub fn circuit_breaker_timeout(mut self, timeout: Duration) -> Self {
        self.config.circuit_breaker_timeout_seconds = timeout.as_secs();
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl_seconds = ttl.as_secs();
        self
    }

    pub fn cache_max_entries(mut self, max: usize) -> Self {
        self.config.cache_max_entries = max;
        self
    }

    pub fn retry_backoff_base(mut self, base: Duration) -> Self {
        self.config.retry_backoff_base_ms = base.as_millis() as u64;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.default_model = model.into();
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.config.default_temperature = temp;
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.config.default_max_tokens = tokens;
        self
    }

    pub fn default_timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.default_timeout_seconds = seconds;
        self
    }

    pub fn default_max_retries(mut self, retries: u32) -> Self {
        self.config.default_max_retries = retries;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Load configuration from environment variables
///
/// Unset or unparsable variables keep their defaults.
pub fn from_env() -> EngineConfig {
    let mut config = EngineConfig::default();

    if let Some(v) = env_parse("PIPELINE_MAX_REQUESTS_PER_MINUTE") {
        config.max_requests_per_minute = v;
    }
    if let Some(v) = env_parse("PIPELINE_CIRCUIT_BREAKER_THRESHOLD") {
        config.circuit_breaker_threshold = v;
    }
    if let Some(v) = env_parse("PIPELINE_CIRCUIT_BREAKER_TIMEOUT_SECONDS") {
        config.circuit_breaker_timeout_seconds = v;
    }
    if let Some(v) = env_parse("PIPELINE_CACHE_TTL_SECONDS") {
        config.cache_ttl_seconds = v;
    }
    if let Some(v) = env_parse("PIPELINE_CACHE_MAX_ENTRIES") {
        config.cache_max_entries = v;
    }
    if let Some(v) = env_parse("PIPELINE_RETRY_BACKOFF_BASE_MS") {
        config.retry_backoff_base_ms = v;
    }
    if let Some(v) = env_parse("PIPELINE_TIMEOUT_SECONDS") {
        config.default_timeout_seconds = v;
    }
    if let Some(v) = env_parse("PIPELINE_MAX_RETRIES") {
        config.default_max_retries = v;
    }
    if let Ok(model) = std::env::var("OPENAI_MODEL") {
        config.default_model = model;
    }
    if let Some(v) = env_parse("OPENAI_TEMPERATURE") {
        config.default_temperature = v;
    }

    config
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<EngineConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| PipelineError::Config {
        message: format!("{}: {}", path.display(), e),
    })?;
    let config: EngineConfig = toml::from_str(&contents).map_err(|e| PipelineError::Config {
        message: format!("{}: {}", path.display(), e),
    })?;
    config.validate()?;
    Ok(config)
}
