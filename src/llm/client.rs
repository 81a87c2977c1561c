//! OpenAI-compatible chat client for answer generation.
//!
//! This module provides the provider seam (`GenerationProvider`) and an
//! HTTP client implementation speaking the chat-completions protocol,
//! including tool-call message fields for the multi-step loop.
//!
//! Transient failures (network errors, rate limits, 5xx) are retried a
//! bounded number of times with a fixed delay before surfacing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// A message in a chat conversation.
///
/// `content` is optional because assistant turns that only request tool
/// calls carry no text; `tool_calls`/`tool_call_id` are populated on the
/// assistant and tool roles respectively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender ("system", "user", "assistant", "tool").
    pub role: String,
    /// Content of the message.
    #[serde(default)]
    pub content: Option<String>,
    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    /// Identifier of the tool call a tool-role message responds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create a tool-result message answering the given tool call.
    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Identifier of this tool call, echoed back on the tool message.
    pub id: String,
    /// Call type; providers currently only emit "function".
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    /// The function to invoke.
    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

/// Name and raw JSON arguments of a requested function call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the tool to call.
    pub name: String,
    /// Arguments as a JSON-encoded string, exactly as the model produced it.
    pub arguments: String,
}

/// Sampling parameters for a generation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature (0.0 - 2.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum number of tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Nucleus sampling parameter (0.0 - 1.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

/// Request for a chat completion.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model identifier to use for generation.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Sampling parameters, flattened into the request body.
    #[serde(flatten)]
    pub sampling: SamplingParams,
    /// OpenAI-style tool specifications exposed to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    /// Tool choice directive ("auto", "none", ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

impl ChatRequest {
    /// Create a new request with default sampling parameters.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            sampling: SamplingParams::default(),
            tools: None,
            tool_choice: None,
        }
    }

    /// Set the sampling parameters.
    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Expose tools to the model; sets `tool_choice` to "auto" if unset.
    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = Some(tools);
        if self.tool_choice.is_none() {
            self.tool_choice = Some("auto".to_string());
        }
        self
    }
}

/// A single generated choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    /// Index of this choice in the response.
    #[serde(default)]
    pub index: u32,
    /// Generated message.
    pub message: ChatMessage,
    /// Reason the generation stopped ("stop", "length", "tool_calls", ...).
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Token usage statistics for a completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Number of tokens generated.
    #[serde(default)]
    pub completion_tokens: u32,
    /// Total tokens used.
    #[serde(default)]
    pub total_tokens: u32,
}

/// Response from a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Identifier assigned by the provider.
    #[serde(default)]
    pub id: String,
    /// Model that produced the response.
    #[serde(default)]
    pub model: String,
    /// Generated choices.
    pub choices: Vec<ChatChoice>,
    /// Token usage statistics.
    #[serde(default)]
    pub usage: TokenUsage,
}

impl ChatResponse {
    /// Content of the first choice, if any.
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }

    /// Finish reason of the first choice, defaulting to the empty string.
    pub fn finish_reason(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            .unwrap_or("")
    }
}

/// The endpoint a model is served from.
///
/// Experiments reference models with their own base URL and credentials, so
/// the endpoint travels with each request rather than living on the client.
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    /// Base URL of the OpenAI-compatible API (e.g. "https://api.openai.com/v1").
    pub base_url: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
}

impl ModelEndpoint {
    /// Create a new endpoint.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
        }
    }
}

/// Trait for providers that can generate chat completions.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Generate a completion for the given request against an endpoint.
    async fn generate(
        &self,
        endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LlmError>;
}

/// Error response body from an OpenAI-compatible API.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)] // Fields kept for complete API error deserialization
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<serde_json::Value>,
}

/// HTTP client for OpenAI-compatible chat-completions endpoints.
pub struct ChatClient {
    /// HTTP client with the configured request timeout.
    http_client: Client,
    /// Total attempts per request (first try included).
    attempts: u32,
    /// Fixed delay between attempts.
    retry_delay: Duration,
}

impl ChatClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Wall-clock timeout for a single HTTP call
    /// * `attempts` - Total attempts per request (minimum 1)
    /// * `retry_delay` - Fixed delay between attempts
    pub fn new(timeout: Duration, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build HTTP client"),
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    async fn try_generate(
        &self,
        endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LlmError> {
        let url = format!(
            "{}/chat/completions",
            endpoint.base_url.trim_end_matches('/')
        );

        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = endpoint.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = http_response.status();

        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());

            if let Ok(error_response) = serde_json::from_str::<ApiErrorResponse>(&error_text) {
                if status_code == 429 {
                    return Err(LlmError::RateLimited(error_response.error.message));
                }
                return Err(LlmError::ApiError {
                    code: status_code,
                    message: error_response.error.message,
                });
            }

            return Err(LlmError::ApiError {
                code: status_code,
                message: error_text,
            });
        }

        let response: ChatResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

        if response.choices.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        Ok(response)
    }
}

#[async_trait]
impl GenerationProvider for ChatClient {
    async fn generate(
        &self,
        endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LlmError> {
        let mut attempt = 1;
        loop {
            match self.try_generate(endpoint, request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    tracing::warn!(
                        attempt = attempt,
                        error = %e,
                        "Provider call failed, retrying after fixed delay"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
