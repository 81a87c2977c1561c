//! HTTP implementation of the tool bridge.
//!
//! Talks to a bridge service exposing:
//!
//! - `GET  /tools`: list of available tool definitions
//! - `POST /tools/{name}/call`: invoke a tool with JSON arguments

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::BridgeError;

use super::{ToolBridge, ToolContent, ToolDefinition};

/// Tool bridge backed by an HTTP service.
///
/// The tool catalog is fetched once at connect time; call sites look tools
/// up from the cached list.
pub struct HttpToolBridge {
    url: String,
    http_client: Client,
    tools: Vec<ToolDefinition>,
}

impl HttpToolBridge {
    /// Connects to the bridge and fetches the tool catalog.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::ConnectionFailed` when the bridge is not
    /// reachable or the catalog cannot be parsed.
    pub async fn connect(url: impl Into<String>) -> Result<Self, BridgeError> {
        let url = url.into();
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        let tools = Self::fetch_tools(&http_client, &url).await?;

        Ok(Self {
            url,
            http_client,
            tools,
        })
    }

    async fn fetch_tools(client: &Client, url: &str) -> Result<Vec<ToolDefinition>, BridgeError> {
        let response = client
            .get(format!("{}/tools", url.trim_end_matches('/')))
            .send()
            .await
            .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BridgeError::ConnectionFailed(format!(
                "tool listing returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| BridgeError::ParseError(e.to_string()))
    }

    /// Returns the cached tool catalog.
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Refreshes the tool catalog from the bridge.
    pub async fn refresh(&mut self) -> Result<(), BridgeError> {
        self.tools = Self::fetch_tools(&self.http_client, &self.url).await?;
        Ok(())
    }
}

#[async_trait]
impl ToolBridge for HttpToolBridge {
    async fn tool_specs(&self, names: &[String]) -> Result<Vec<serde_json::Value>, BridgeError> {
        let mut specs = Vec::with_capacity(names.len());
        for name in names {
            let def = self
                .tools
                .iter()
                .find(|t| &t.name == name)
                .ok_or_else(|| BridgeError::ToolNotFound(name.clone()))?;
            specs.push(def.to_function_spec());
        }
        Ok(specs)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: &str,
    ) -> Result<Option<ToolContent>, BridgeError> {
        // The model is free to emit broken JSON; that voids this one call,
        // not the whole generation.
        let params: serde_json::Value = match serde_json::from_str(arguments) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(tool = name, error = %e, "Failed to decode tool arguments");
                return Ok(None);
            }
        };

        let response = self
            .http_client
            .post(format!(
                "{}/tools/{}/call",
                self.url.trim_end_matches('/'),
                name
            ))
            .json(&params)
            .send()
            .await
            .map_err(|e| BridgeError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(BridgeError::CallFailed {
                code: status.as_u16(),
                message,
            });
        }

        let content: ToolContent = response
            .json()
            .await
            .map_err(|e| BridgeError::ParseError(e.to_string()))?;

        Ok(Some(content))
    }
}
