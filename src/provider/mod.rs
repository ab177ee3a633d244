//! Model provider abstraction
//!
//! What this module provides
//! - `ChatRequest`/`ChatResponse`: the single round trip the engine needs
//!   (system + user prompt in, one text payload out)
//! - `ModelSvc`: boxed `Service<ChatRequest, Response = ChatResponse, Error = BoxError>`
//! - `OpenAIProvider`: async-openai adapter requesting `response_format: json_object`
//! - `ScriptedProvider`: deterministic provider replaying scripted replies and failures
//!
//! Composition
//! - The engine owns one `ModelSvc` and stacks rate limiting and a timeout on
//!   top of it per call; swapping providers never touches the engine.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use serde::{Deserialize, Serialize};
use tower::{util::BoxCloneService, BoxError, Service};

use crate::error::{classify_openai, PipelineError};

/// One chat-completion round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the model for a JSON object.
    pub json_mode: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: Usage,
}

/// Boxed model service type alias.
pub type ModelSvc = BoxCloneService<ChatRequest, ChatResponse, BoxError>;

/// OpenAI chat-completion provider.
#[derive(Clone)]
pub struct OpenAIProvider {
    client: Arc<Client<OpenAIConfig>>,
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAIProvider {
    /// Provider using `OPENAI_API_KEY` from the environment.
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client<OpenAIConfig>) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    pub fn build_request(req: &ChatRequest) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(req.system.clone())
            .build()?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(req.user.clone())
            .build()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&req.model)
            .messages(vec![system.into(), user.into()])
            .temperature(req.temperature)
            .max_tokens(req.max_tokens);
        if req.json_mode {
            builder.response_format(ResponseFormat::JsonObject);
        }
        builder.build()
    }
}

impl Service<ChatRequest> for OpenAIProvider {
    type Response = ChatResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ChatRequest) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let request = Self::build_request(&req).map_err(upstream_error)?;
            let resp = client
                .chat()
                .create(request)
                .await
                .map_err(upstream_error)?;

            let content = resp
                .choices
                .first()
                .and_then(|choice| choice.message.content.clone())
                .ok_or_else(|| -> BoxError {
                    Box::new(PipelineError::InvalidResponse {
                        message: "no content in response".to_string(),
                    })
                })?;
            let usage = resp
                .usage
                .map(|u| Usage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                })
                .unwrap_or_default();

            Ok(ChatResponse {
                content,
                model: resp.model,
                usage,
            })
        })
    }
}

fn upstream_error(err: OpenAIError) -> BoxError {
    Box::new(classify_openai(err))
}

/// One scripted provider outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Scripted {
    Reply(String),
    Fail(String),
    RateLimited(String),
}

/// Provider replaying a script of replies and failures.
///
/// Once the script runs out it repeats the `otherwise` outcome (an empty JSON
/// object unless set). Clones share the script and the call log.
#[derive(Clone)]
pub struct ScriptedProvider {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    otherwise: Arc<Mutex<Scripted>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
    calls: Arc<AtomicUsize>,
    latency: Duration,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            otherwise: Arc::new(Mutex::new(Scripted::Reply("{}".to_string()))),
            requests: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            latency: Duration::ZERO,
        }
    }

    pub fn reply(self, content: impl Into<String>) -> Self {
        self.push(Scripted::Reply(content.into()))
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.push(Scripted::Fail(message.into()))
    }

    pub fn rate_limited(self, message: impl Into<String>) -> Self {
        self.push(Scripted::RateLimited(message.into()))
    }

    pub fn always_reply(self, content: impl Into<String>) -> Self {
        self.set_otherwise(Scripted::Reply(content.into()))
    }

    pub fn always_fail(self, message: impl Into<String>) -> Self {
        self.set_otherwise(Scripted::Fail(message.into()))
    }

    /// Delay every call by `latency` (tokio time).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of calls received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn into_service(self) -> ModelSvc {
        BoxCloneService::new(self)
    }

    fn push(self, outcome: Scripted) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(outcome);
        self
    }

    fn set_otherwise(self, outcome: Scripted) -> Self {
        *self.otherwise.lock().unwrap_or_else(|p| p.into_inner()) = outcome;
        self
    }

    fn next_outcome(&self) -> Scripted {
        let next = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        next.unwrap_or_else(|| {
            self.otherwise
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone()
        })
    }
}

impl Service<ChatRequest> for ScriptedProvider {
    type Response = ChatResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ChatRequest) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let model = req.model.clone();
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(req);
        let outcome = self.next_outcome();
        let latency = self.latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            match outcome {
                Scripted::Reply(content) => Ok(ChatResponse {
                    content,
                    model,
                    usage: Usage::default(),
                }),
                Scripted::Fail(message) => Err(Box::new(PipelineError::Other(message)) as BoxError),
                Scripted::RateLimited(message) => {
                    Err(Box::new(PipelineError::RateLimited { message }) as BoxError)
                }
            }
        })
    }
}
