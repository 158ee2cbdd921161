/*!
 * Provider clients for the network stages of the pipeline.
 *
 * This module contains the seams the pipeline talks to:
 * - `Translator`: turns one segment of source text into the target language
 * - `SpeechSynthesizer`: renders one translated segment to an audio file
 *
 * Clients never retry on their own. Every failure surfaces as a
 * `ProviderError` whose code the recovery layer classifies.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::app_config::{SpeechConfig, SpeechProvider, TranslationConfig, TranslationProvider};
use crate::errors::ProviderError;

pub mod anthropic;
pub mod mock;
pub mod ollama;
pub mod openai_speech;

/// One segment to translate
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    /// Source text of the segment
    pub text: String,
    /// Target language code
    pub target_language: String,
    /// Model recorded on the task
    pub model: String,
}

/// One segment to synthesize
#[derive(Debug, Clone)]
pub struct SpeechRequest {
    /// Translated text of the segment
    pub text: String,
    /// Voice recorded on the task
    pub voice: String,
    /// Model recorded on the task
    pub model: String,
    /// Where the audio should be written
    pub output: PathBuf,
}

/// Translates segment text
#[async_trait]
pub trait Translator: Send + Sync {
    /// Provider identifier, as stored on tasks
    fn name(&self) -> &str;

    /// Translate one segment and return the translated text
    async fn translate(&self, request: &TranslationRequest) -> Result<String, ProviderError>;
}

/// Synthesizes speech for segment text
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Provider identifier, as stored on tasks
    fn name(&self) -> &str;

    /// Write audio for one segment and return the written path
    async fn synthesize(&self, request: &SpeechRequest) -> Result<PathBuf, ProviderError>;
}

/// Build the configured translator
pub fn translator_from_config(config: &TranslationConfig) -> Arc<dyn Translator> {
    match config.provider {
        TranslationProvider::Ollama => Arc::new(ollama::Ollama::from_config(config)),
        TranslationProvider::Anthropic => Arc::new(anthropic::Anthropic::from_config(config)),
    }
}

/// Build the configured speech synthesizer
pub fn synthesizer_from_config(config: &SpeechConfig) -> Arc<dyn SpeechSynthesizer> {
    match config.provider {
        SpeechProvider::OpenAI => Arc::new(openai_speech::OpenAISpeech::from_config(config)),
    }
}

/// Map a non-success HTTP status onto the provider taxonomy
pub(crate) fn status_error(status: u16, body: String) -> ProviderError {
    match status {
        401 | 403 => ProviderError::AuthenticationError(body),
        429 => ProviderError::RateLimitExceeded(body),
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

/// Fill the `{target_language}` placeholder of a system prompt
pub(crate) fn render_system_prompt(template: &str, target_language: &str) -> String {
    let language = crate::language_utils::get_language_name(target_language)
        .unwrap_or_else(|_| target_language.to_string());
    template.replace("{target_language}", &language)
}

/// Join an endpoint and a path without doubling slashes
pub(crate) fn join_endpoint(endpoint: &str, path: &str) -> String {
    format!(
        "{}/{}",
        endpoint.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Make sure the parent directory of an output file exists
pub(crate) async fn ensure_parent(path: &Path) -> Result<(), ProviderError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ProviderError::RequestFailed(format!("{}: {}", parent.display(), e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statusError_shouldMapAuthAndRateLimit() {
        assert_eq!(status_error(401, String::new()).code(), "E_PROVIDER_AUTH");
        assert_eq!(status_error(429, String::new()).code(), "E_RATE_LIMIT");
        assert_eq!(status_error(503, String::new()).code(), "E_PROVIDER_UNAVAILABLE");
        assert_eq!(status_error(400, String::new()).code(), "E_PROVIDER_REJECTED");
    }

    #[test]
    fn test_renderSystemPrompt_shouldUseLanguageName() {
        assert_eq!(
            render_system_prompt("Translate into {target_language}.", "fr"),
            "Translate into French."
        );
        assert_eq!(render_system_prompt("To {target_language}", "zz"), "To zz");
    }

    #[test]
    fn test_joinEndpoint_shouldNormalizeSlashes() {
        assert_eq!(
            join_endpoint("http://localhost:11434/", "/api/chat"),
            "http://localhost:11434/api/chat"
        );
    }
}
