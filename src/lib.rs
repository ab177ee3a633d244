//! # Tower LLM Pipeline
//!
//! A Tower-based reliability shell for LLM-backed business pipeline steps
//! (requirements, tasks, quality checks, fake-content detection, goal
//! decomposition, asset extraction, deliverable assembly).
//!
//! ## Core Concepts
//!
//! - **Engine**: `PipelineEngine` runs a step through circuit breaker → cache →
//!   rate limiter → model call under timeout → parse, retrying with exponential
//!   backoff and falling back to canned payloads
//! - **Steps**: a `StepRegistry` maps each `StepType` to its prompt builder and
//!   fallback payload; results are typed `StepOutput` records
//! - **Providers**: the model is any `Service<ChatRequest>`; `OpenAIProvider`
//!   talks to the OpenAI API, `ScriptedProvider` replays canned answers
//! - **Static DI**: engines are built once and passed around; nothing is global
//!
//! ## Getting Started
//!
//! Set your OpenAI API key in the `OPENAI_API_KEY` environment variable.
//!
//! ```rust,no_run
//! use tower_llm_pipeline::{EngineConfig, PipelineContext, PipelineEngine, StepType};
//! use async_openai::Client;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let engine = PipelineEngine::builder(EngineConfig::default())
//!     .openai(Client::new())
//!     .build()?;
//!
//! let mut ctx = PipelineContext::for_workspace("ws-1").goal("goal-7");
//! let result = engine
//!     .execute_step(
//!         &StepType::GoalDecomposition,
//!         &serde_json::json!({ "goal": "Reach 10k newsletter subscribers" }),
//!         &mut ctx,
//!         None,
//!         None,
//!     )
//!     .await;
//!
//! if result.success {
//!     println!("{}", result.payload());
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod observability;
pub mod operations;
pub mod provider;
pub mod resilience;
pub mod result;
pub mod steps;

// Public re-exports for convenience
pub use config::{ConfigBuilder, EngineConfig};
pub use context::PipelineContext;
pub use engine::{EngineBuilder, PipelineEngine, StepRequest};
pub use error::{PipelineError, Result};
pub use observability::{StatsSnapshot, TracingLayer};
pub use provider::{ChatRequest, ChatResponse, ModelSvc, OpenAIProvider, ScriptedProvider};
pub use resilience::CircuitState;
pub use result::PipelineResult;
pub use steps::{StepDefinition, StepOutput, StepRegistry, StepType};

// Re-export async-openai types that users need
pub use async_openai::{config::OpenAIConfig, Client};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
