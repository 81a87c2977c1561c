//! Generation provider integration.
//!
//! This module provides the chat-completions client used for answer
//! generation and the multi-step tool-calling loop built on top of it.
//!
//! ```ignore
//! use evalforge::llm::{ChatClient, ChatMessage, ChatRequest, ModelEndpoint, MultiStepGenerator};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let client = Arc::new(ChatClient::new(Duration::from_secs(120), 3, Duration::from_secs(2)));
//! let agent = MultiStepGenerator::new(client, None, 10);
//!
//! let endpoint = ModelEndpoint::new("https://api.openai.com/v1", Some("sk-...".into()));
//! let request = ChatRequest::new("gpt-4", vec![ChatMessage::user("2 + 2?")]);
//! let (response, steps) = agent.generate(&endpoint, request).await?;
//! ```

pub mod agent;
pub mod client;

pub use agent::{MultiStepGenerator, StepTrace, ToolStep, DEFAULT_MAX_STEPS};
pub use client::{
    ChatChoice, ChatClient, ChatMessage, ChatRequest, ChatResponse, FunctionCall,
    GenerationProvider, ModelEndpoint, SamplingParams, TokenUsage, ToolCallRequest,
};
