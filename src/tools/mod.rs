//! Tool bridge integration for agentic generation.
//!
//! The bridge exposes named tools the model can call during the multi-step
//! loop. The engine only depends on the `ToolBridge` seam; the HTTP
//! implementation lives in [`http`].

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

pub use http::HttpToolBridge;

/// Definition of a tool as advertised by the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name, used for lookup and invocation.
    pub name: String,
    /// Human-readable description handed to the model.
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool's arguments.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    /// Convert this definition to an OpenAI-style function spec.
    pub fn to_function_spec(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }
}

/// One part of a tool invocation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    /// Part type; only "text" parts carry content the loop can use.
    #[serde(rename = "type")]
    pub kind: String,
    /// Text payload for "text" parts.
    #[serde(default)]
    pub text: Option<String>,
}

/// Result of a tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolContent {
    /// Content parts returned by the tool.
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

impl ToolContent {
    /// Concatenates all textual parts, separated by blank lines.
    ///
    /// Returns `None` when the result carries no text at all.
    pub fn joined_text(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .content
            .iter()
            .filter(|part| part.kind == "text")
            .filter_map(|part| part.text.as_deref())
            .collect();

        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n\n"))
        }
    }
}

/// Trait for executing tool invocations by name.
#[async_trait]
pub trait ToolBridge: Send + Sync {
    /// Returns OpenAI-style function specs for the named tools.
    async fn tool_specs(&self, names: &[String]) -> Result<Vec<serde_json::Value>, BridgeError>;

    /// Invokes a tool with JSON-encoded arguments.
    ///
    /// Malformed JSON arguments yield `Ok(None)` (a null result) rather
    /// than an error; only transport and bridge-side failures propagate.
    async fn call_tool(
        &self,
        name: &str,
        arguments: &str,
    ) -> Result<Option<ToolContent>, BridgeError>;
}
