//! Error types shared across subsystems.
//!
//! Defines error enums for:
//! - Generation provider interactions
//! - Tool bridge invocations
//! - Metric evaluation
//!
//! Queue, pool, dispatch and storage errors live next to the code that
//! produces them.

use thiserror::Error;

/// Errors that can occur when talking to a generation provider.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse provider response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Provider returned no choices")]
    EmptyResponse,

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Tool bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    /// Whether a bounded retry with a fixed delay is worth attempting.
    ///
    /// Network failures, rate limits and provider-side (5xx) errors are
    /// transient; everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(_) | LlmError::RateLimited(_) => true,
            LlmError::ApiError { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

/// Errors that can occur during tool bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Bridge connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Bridge request failed: {0}")]
    RequestFailed(String),

    #[error("Tool '{0}' not found on the bridge")]
    ToolNotFound(String),

    #[error("Bridge call error ({code}): {message}")]
    CallFailed { code: u16, message: String },

    #[error("Failed to parse bridge response: {0}")]
    ParseError(String),
}

/// Errors that can occur during metric evaluation.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("Metric '{0}' not found")]
    NotFound(String),

    #[error("Metric requires a non-null `{0}` value")]
    MissingRequire(String),

    #[error("Metric evaluation failed: {0}")]
    Evaluation(String),
}
