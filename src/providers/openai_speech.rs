use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use reqwest::Client;
use serde::Serialize;

use crate::app_config::SpeechConfig;
use crate::errors::ProviderError;
use crate::providers::{SpeechRequest, SpeechSynthesizer, ensure_parent, join_endpoint, status_error};

/// Client for an OpenAI-compatible `/audio/speech` endpoint
#[derive(Debug, Clone)]
pub struct OpenAISpeech {
    client: Client,
    api_key: String,
    endpoint: String,
}

/// Speech request body
#[derive(Debug, Serialize)]
pub struct SpeechBody<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

impl OpenAISpeech {
    pub fn new(api_key: impl Into<String>, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Create a client from the speech section of the config
    pub fn from_config(config: &SpeechConfig) -> Self {
        Self::new(
            config.api_key.clone(),
            config.endpoint.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAISpeech {
    fn name(&self) -> &str {
        "openai"
    }

    async fn synthesize(&self, request: &SpeechRequest) -> Result<PathBuf, ProviderError> {
        let url = join_endpoint(&self.endpoint, "audio/speech");
        let body = SpeechBody {
            model: &request.model,
            input: &request.text,
            voice: &request.voice,
            response_format: "mp3",
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Speech API error ({}): {}", status, error_text);
            return Err(status_error(status.as_u16(), error_text));
        }

        let audio = response.bytes().await.map_err(ProviderError::from_transport)?;
        if audio.is_empty() {
            return Err(ProviderError::ParseError(
                "Speech API returned an empty body".to_string(),
            ));
        }

        ensure_parent(&request.output).await?;
        tokio::fs::write(&request.output, &audio)
            .await
            .map_err(|e| ProviderError::RequestFailed(format!("{}: {}", request.output.display(), e)))?;
        debug!("Wrote {} bytes to {}", audio.len(), request.output.display());

        Ok(request.output.clone())
    }
}
