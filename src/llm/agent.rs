//! Multi-step generation with tool calling.
//!
//! Runs the conversation as a small state machine:
//!
//! ```text
//! Generating ──finish_reason stop/length/empty──▶ Done
//!     │                                            ▲
//!     └──tool_calls──▶ ToolCalling ──step budget──┘
//!                           │
//!                           └──────▶ Generating
//! ```
//!
//! Each `ToolCalling` turn executes every requested tool through the
//! bridge, appends the results to the conversation, and records a substep
//! trace for auditability. Exhausting the step budget returns the last
//! response as-is; it is a cutoff, not an error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::client::{ChatMessage, ChatRequest, ChatResponse, GenerationProvider, ModelEndpoint};
use crate::tools::ToolBridge;

/// Default maximum rounds of the tool-calling loop.
pub const DEFAULT_MAX_STEPS: usize = 10;

/// Placeholder handed to the model when a tool produced no text.
const EMPTY_TOOL_RESULT: &str = "the tool call result is empty";

/// One executed tool call, kept in the answer trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolStep {
    /// Name of the invoked tool.
    pub tool_name: String,
    /// Raw JSON arguments as the model produced them.
    pub tool_params: String,
    /// Text handed back to the model.
    pub tool_result: String,
}

/// Step trace of a generation: one entry per turn that made tool calls.
pub type StepTrace = Vec<Vec<ToolStep>>;

/// Loop states; `Done` carries the response to return.
enum LoopState {
    Generating,
    ToolCalling(ChatResponse),
    Done(ChatResponse),
}

/// Driver for multi-step generation.
pub struct MultiStepGenerator {
    provider: Arc<dyn GenerationProvider>,
    bridge: Option<Arc<dyn ToolBridge>>,
    max_steps: usize,
}

impl MultiStepGenerator {
    /// Create a new generator.
    ///
    /// Without a bridge the loop degenerates to a single provider call.
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        bridge: Option<Arc<dyn ToolBridge>>,
        max_steps: usize,
    ) -> Self {
        Self {
            provider,
            bridge,
            max_steps: max_steps.max(1),
        }
    }

    /// Run the loop to completion.
    ///
    /// Returns the final response and the full step trace.
    pub async fn generate(
        &self,
        endpoint: &ModelEndpoint,
        mut request: ChatRequest,
    ) -> Result<(ChatResponse, StepTrace), LlmError> {
        let mut steps: StepTrace = Vec::new();
        let mut step = 0;
        let mut state = LoopState::Generating;

        loop {
            state = match state {
                LoopState::Generating => {
                    step += 1;
                    let response = self.provider.generate(endpoint, &request).await?;
                    let finish = response.finish_reason();

                    if self.bridge.is_none() || matches!(finish, "" | "stop" | "length") {
                        LoopState::Done(response)
                    } else {
                        if finish != "tool_calls" {
                            tracing::warn!(finish_reason = finish, "Unexpected finish reason");
                        }
                        LoopState::ToolCalling(response)
                    }
                }
                LoopState::ToolCalling(response) => {
                    let bridge = self
                        .bridge
                        .as_ref()
                        .expect("ToolCalling state requires a bridge");

                    let assistant = response
                        .choices
                        .first()
                        .ok_or(LlmError::EmptyResponse)?
                        .message
                        .clone();
                    let tool_calls = assistant.tool_calls.clone().unwrap_or_default();
                    request.messages.push(assistant);

                    let mut substeps = Vec::with_capacity(tool_calls.len());
                    for call in &tool_calls {
                        let result = bridge
                            .call_tool(&call.function.name, &call.function.arguments)
                            .await?;

                        let text = result
                            .and_then(|content| content.joined_text())
                            .unwrap_or_else(|| EMPTY_TOOL_RESULT.to_string());

                        request
                            .messages
                            .push(ChatMessage::tool(text.clone(), call.id.clone()));

                        substeps.push(ToolStep {
                            tool_name: call.function.name.clone(),
                            tool_params: call.function.arguments.clone(),
                            tool_result: text,
                        });
                    }

                    if !substeps.is_empty() {
                        steps.push(substeps);
                    }

                    if step >= self.max_steps {
                        tracing::warn!(
                            max_steps = self.max_steps,
                            "Multi-step generation reached its step budget"
                        );
                        LoopState::Done(response)
                    } else {
                        LoopState::Generating
                    }
                }
                LoopState::Done(response) => return Ok((response, steps)),
            };
        }
    }
}
