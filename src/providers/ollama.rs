use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::app_config::TranslationConfig;
use crate::errors::ProviderError;
use crate::providers::{
    TranslationRequest, Translator, join_endpoint, render_system_prompt, status_error,
};

/// Ollama client translating segments through the chat API
#[derive(Debug, Clone)]
pub struct Ollama {
    /// Base URL of the Ollama API
    base_url: String,
    /// HTTP client for making requests
    client: Client,
    /// System prompt template
    system_prompt: String,
    /// Sampling temperature
    temperature: f32,
}

/// Chat message object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender (system, user, assistant)
    pub role: String,
    /// Content of the message
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Generation options for the Ollama API
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

/// Chat request for the Ollama API
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model name to use for generation
    model: String,
    /// Messages of the conversation
    messages: Vec<ChatMessage>,
    /// Additional model parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerationOptions>,
    /// Whether to stream the response
    stream: bool,
}

impl ChatRequest {
    /// Create a new non-streaming chat request
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            options: None,
            stream: false,
        }
    }

    /// Set the temperature
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.options
            .get_or_insert_with(GenerationOptions::default)
            .temperature = Some(temperature);
        self
    }
}

/// Chat response from the Ollama API
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Model name
    pub model: String,
    /// Response message
    pub message: ChatMessage,
    /// Whether the generation is complete
    pub done: bool,
    /// Number of generated tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
}

impl Ollama {
    /// Create a client for `endpoint` with a request timeout
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: endpoint.into(),
            client: Client::builder()
                .timeout(timeout)
                // Ollama speaks HTTP/1.1
                .http1_only()
                .pool_idle_timeout(Duration::from_secs(90))
                .build()
                .unwrap_or_default(),
            system_prompt: String::new(),
            temperature: 0.3,
        }
    }

    /// Create a client from the translation section of the config
    pub fn from_config(config: &TranslationConfig) -> Self {
        let mut client = Self::new(
            config.get_endpoint(),
            Duration::from_secs(config.get_timeout_secs()),
        );
        client.system_prompt = config.system_prompt.clone();
        client.temperature = config.temperature;
        client
    }

    /// Send a chat request
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = join_endpoint(&self.base_url, "api/chat");
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Ollama API error ({}): {}", status, body);
            return Err(status_error(status.as_u16(), body));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))
    }
}

#[async_trait]
impl Translator for Ollama {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn translate(&self, request: &TranslationRequest) -> Result<String, ProviderError> {
        let chat = ChatRequest::new(
            &request.model,
            vec![
                ChatMessage::system(render_system_prompt(
                    &self.system_prompt,
                    &request.target_language,
                )),
                ChatMessage::user(&request.text),
            ],
        )
        .temperature(self.temperature);

        let response = self.chat(&chat).await?;
        debug!(
            "Ollama translated {} chars ({} tokens)",
            request.text.chars().count(),
            response.eval_count.unwrap_or_default()
        );

        let text = response.message.content.trim();
        if text.is_empty() {
            return Err(ProviderError::ParseError(
                "Ollama returned an empty translation".to_string(),
            ));
        }
        Ok(text.to_string())
    }
}
