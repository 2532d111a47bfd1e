//! Chat-completion client shared by all three tiers.
//!
//! Every backend speaks the OpenAI-compatible `/v1/chat/completions`
//! contract (llama.cpp, vllm, Ollama, TGI all expose it), so one HTTP
//! client covers the fleet; tiers differ only in base URL, model, budget,
//! timeout, and retry count.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LlmError {
    /// Connection-level failure (DNS, refused, TLS).
    #[error("http error: {0}")]
    Http(String),
    /// Non-success status from the backend.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },
    /// Response body was not the expected JSON shape.
    #[error("parse error: {0}")]
    Parse(String),
    #[error("request timed out")]
    Timeout,
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Http(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One completion call, fully specified.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

// ---------------------------------------------------------------------------
// LlmClient trait
// ---------------------------------------------------------------------------

/// Uniform chat-completion contract against a single backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

// ---------------------------------------------------------------------------
// HttpLlmClient
// ---------------------------------------------------------------------------

/// Client for OpenAI-compatible chat-completion endpoints.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Build the JSON request body. `stream` is always false; the daemon
    /// consumes whole responses.
    pub fn build_request_body(request: &CompletionRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.to_string(),
                    "content": m.content,
                })
            })
            .collect();

        serde_json::json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "stream": false,
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let body = Self::build_request_body(request);

        let resp = self
            .http
            .post(&url)
            .timeout(request.timeout)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let choice = parsed
            .choices
            .first()
            .ok_or_else(|| LlmError::Parse("no choices in response".into()))?;

        Ok(choice.message.content.clone().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// TierClient
// ---------------------------------------------------------------------------

/// One inference tier: a client plus its cadence-independent call policy
/// (model, response budget, timeout, bounded retries).
#[derive(Clone)]
pub struct TierClient {
    client: Arc<dyn LlmClient>,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub retries: u32,
}

impl TierClient {
    pub fn new(
        client: Arc<dyn LlmClient>,
        model: impl Into<String>,
        max_tokens: u32,
        timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens,
            timeout,
            retries,
        }
    }

    /// Complete with this tier's policy. Transient errors are retried up to
    /// the tier's budget with linear backoff; the last error is returned.
    pub async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            timeout: self.timeout,
        };

        let mut last_err = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                debug!(model = %self.model, attempt, "retrying completion");
            }
            match self.client.complete(&request).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    warn!(model = %self.model, attempt, error = %e, "completion failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| LlmError::Http("no attempts made".into())))
    }
}

// ---------------------------------------------------------------------------
// MockLlm
// ---------------------------------------------------------------------------

/// Deterministic in-memory client for tests.
///
/// Pops queued responses in order; an empty queue yields a fixed default.
/// Captures every request so tests can assert on prompts.
#[derive(Default)]
pub struct MockLlm {
    responses: Mutex<VecDeque<Result<String>>>,
    captured: Mutex<Vec<CompletionRequest>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.responses.lock().unwrap().push_back(Ok(text.into()));
        self
    }

    pub fn with_error(self, error: LlmError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn push_response(&self, text: impl Into<String>) {
        self.responses.lock().unwrap().push_back(Ok(text.into()));
    }

    pub fn captured(&self) -> Vec<CompletionRequest> {
        self.captured.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.captured.lock().unwrap().push(request.clone());
        match self.responses.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok("ok".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
