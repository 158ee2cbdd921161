use std::time::Duration;

use async_trait::async_trait;
use log::error;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::app_config::TranslationConfig;
use crate::errors::ProviderError;
use crate::providers::{
    TranslationRequest, Translator, join_endpoint, render_system_prompt, status_error,
};

/// Upper bound on generated tokens for one segment
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Anthropic client for interacting with the messages API
#[derive(Debug, Clone)]
pub struct Anthropic {
    /// HTTP client for API requests
    client: Client,
    /// API key for authentication
    api_key: String,
    /// API endpoint URL
    endpoint: String,
    system_prompt: String,
    temperature: f32,
}

/// Anthropic message request
#[derive(Debug, Serialize)]
pub struct AnthropicRequest {
    /// The model to use
    model: String,

    /// The messages for the conversation
    messages: Vec<AnthropicMessage>,

    /// System prompt to guide the AI
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,

    /// Temperature for generation
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,

    /// Maximum number of tokens to generate
    max_tokens: u32,
}

/// Anthropic message format
#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicMessage {
    /// Role of the message sender (user, assistant)
    pub role: String,

    /// Content of the message
    pub content: String,
}

/// Anthropic response
#[derive(Debug, Deserialize)]
pub struct AnthropicResponse {
    /// The content of the response
    pub content: Vec<AnthropicContent>,
}

/// Individual content block in an Anthropic response
#[derive(Debug, Deserialize)]
pub struct AnthropicContent {
    /// The type of content
    #[serde(rename = "type")]
    pub content_type: String,

    /// The actual text content
    #[serde(default)]
    pub text: String,
}

impl AnthropicRequest {
    /// Create a new Anthropic request
    pub fn new(model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            system: None,
            temperature: None,
            max_tokens,
        }
    }

    /// Add a message to the request
    pub fn add_message(mut self, role: impl Into<String>, content: impl Into<String>) -> Self {
        self.messages.push(AnthropicMessage {
            role: role.into(),
            content: content.into(),
        });
        self
    }

    /// Set the system prompt
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set the temperature
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

impl AnthropicResponse {
    /// Concatenate the text blocks of the response
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|c| c.content_type == "text")
            .map(|c| c.text.as_str())
            .collect()
    }
}

impl Anthropic {
    /// Create a new Anthropic client
    pub fn new(api_key: impl Into<String>, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            endpoint: endpoint.into(),
            system_prompt: String::new(),
            temperature: 0.3,
        }
    }

    /// Create a client from the translation section of the config
    pub fn from_config(config: &TranslationConfig) -> Self {
        let mut client = Self::new(
            config.get_api_key(),
            config.get_endpoint(),
            Duration::from_secs(config.get_timeout_secs()),
        );
        client.system_prompt = config.system_prompt.clone();
        client.temperature = config.temperature;
        client
    }

    /// Complete a messages request
    pub async fn complete(&self, request: &AnthropicRequest) -> Result<AnthropicResponse, ProviderError> {
        let api_url = join_endpoint(&self.endpoint, "v1/messages");

        let response = self
            .client
            .post(&api_url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(request)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to get error response text".to_string());
            error!("Anthropic API error ({}): {}", status, error_text);
            return Err(status_error(status.as_u16(), error_text));
        }

        response
            .json::<AnthropicResponse>()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))
    }
}

#[async_trait]
impl Translator for Anthropic {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn translate(&self, request: &TranslationRequest) -> Result<String, ProviderError> {
        let message = AnthropicRequest::new(&request.model, DEFAULT_MAX_TOKENS)
            .system(render_system_prompt(&self.system_prompt, &request.target_language))
            .temperature(self.temperature)
            .add_message("user", &request.text);

        let response = self.complete(&message).await?;
        let text = response.text();
        let text = text.trim();
        if text.is_empty() {
            return Err(ProviderError::ParseError(
                "Anthropic returned no text content".to_string(),
            ));
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shouldSerializeSystemAndMessages() {
        let request = AnthropicRequest::new("claude-3-haiku", 64)
            .system("sys")
            .add_message("user", "Hello");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["system"], "sys");
        assert_eq!(json["messages"][0]["content"], "Hello");
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_responseText_shouldSkipNonTextBlocks() {
        let body = r#"{"content":[{"type":"text","text":"Bon"},{"type":"tool_use"},{"type":"text","text":"jour"}]}"#;
        let response: AnthropicResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.text(), "Bonjour");
    }
}
