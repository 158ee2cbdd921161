use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::default::Default;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pipeline::Stage;
use crate::recovery::RetryPolicy;
use crate::segmentation::{SegmentationOptions, SegmentationStrategy};

/// Application configuration module
/// This module handles the application configuration including loading,
/// validating and saving configuration settings.
/// Represents the application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Default target language code (ISO) for new tasks
    pub target_language: String,

    /// SQLite database location (defaults to the user data directory)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Root of the per-task working directories
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,

    /// External tools
    #[serde(default)]
    pub toolchain: ToolchainConfig,

    /// Translation config
    #[serde(default)]
    pub translation: TranslationConfig,

    /// Speech synthesis config
    #[serde(default)]
    pub speech: SpeechConfig,

    /// Scheduler, retry and queue settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Translation provider type
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranslationProvider {
    // @provider: Ollama
    #[default]
    Ollama,
    // @provider: Anthropic
    Anthropic,
}

impl TranslationProvider {
    // @returns: Capitalized provider name
    pub fn display_name(&self) -> &str {
        match self {
            Self::Ollama => "Ollama",
            Self::Anthropic => "Anthropic",
        }
    }

    // @returns: Lowercase provider identifier
    pub fn to_lowercase_string(&self) -> String {
        match self {
            Self::Ollama => "ollama".to_string(),
            Self::Anthropic => "anthropic".to_string(),
        }
    }
}

// Implement Display trait for TranslationProvider
impl std::fmt::Display for TranslationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_lowercase_string())
    }
}

// Implement FromStr trait for TranslationProvider
impl std::str::FromStr for TranslationProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "anthropic" => Ok(Self::Anthropic),
            _ => Err(anyhow!("Invalid provider type: {}", s)),
        }
    }
}

/// Speech provider type
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpeechProvider {
    // @provider: OpenAI-compatible /audio/speech endpoint
    #[default]
    OpenAI,
}

impl std::fmt::Display for SpeechProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAI => write!(f, "openai"),
        }
    }
}

impl std::str::FromStr for SpeechProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            _ => Err(anyhow!("Invalid speech provider: {}", s)),
        }
    }
}

/// Provider configuration wrapper
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    // @field: Provider type identifier
    #[serde(rename = "type")]
    pub provider_type: String,

    // @field: Model name
    #[serde(default = "String::new")]
    pub model: String,

    // @field: API key
    #[serde(default = "String::new")]
    pub api_key: String,

    // @field: Service URL
    #[serde(default = "String::new")]
    pub endpoint: String,

    // @field: Timeout seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ProviderConfig {
    // @param provider_type: Provider enum
    // @returns: Provider config with defaults
    pub fn new(provider_type: TranslationProvider) -> Self {
        match provider_type {
            TranslationProvider::Ollama => Self {
                provider_type: "ollama".to_string(),
                model: default_ollama_model(),
                api_key: String::new(),
                endpoint: default_ollama_endpoint(),
                timeout_secs: default_timeout_secs(),
            },
            TranslationProvider::Anthropic => Self {
                provider_type: "anthropic".to_string(),
                model: default_anthropic_model(),
                api_key: String::new(),
                endpoint: default_anthropic_endpoint(),
                timeout_secs: default_anthropic_timeout_secs(),
            },
        }
    }
}

/// Translation service configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TranslationConfig {
    /// Translation provider to use
    #[serde(default)]
    pub provider: TranslationProvider,

    /// Available translation providers
    #[serde(default)]
    pub available_providers: Vec<ProviderConfig>,

    /// System prompt template for translation
    /// Placeholders: {target_language}
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Temperature parameter for text generation (0.0 to 1.0)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

/// Speech synthesis configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SpeechConfig {
    /// Speech provider to use
    #[serde(default)]
    pub provider: SpeechProvider,

    /// Synthesis model
    #[serde(default = "default_speech_model")]
    pub model: String,

    /// Default voice for new tasks
    #[serde(default = "default_speech_voice")]
    pub voice: String,

    /// API key for the service
    #[serde(default = "String::new")]
    pub api_key: String,

    /// Service endpoint URL
    #[serde(default = "default_openai_endpoint")]
    pub endpoint: String,

    /// Request timeout in seconds
    #[serde(default = "default_speech_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            provider: SpeechProvider::default(),
            model: default_speech_model(),
            voice: default_speech_voice(),
            api_key: String::new(),
            endpoint: default_openai_endpoint(),
            timeout_secs: default_speech_timeout_secs(),
        }
    }
}

/// Whether the transcriber may use GPU acceleration
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuAcceleration {
    /// Use the GPU when one is detected
    #[default]
    Auto,
    On,
    Off,
}

/// External tool configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ToolchainConfig {
    /// Media downloader program (name on PATH or absolute path)
    #[serde(default = "default_downloader")]
    pub downloader: String,

    /// ffmpeg program
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,

    /// Speech-to-text program
    #[serde(default = "default_transcriber")]
    pub transcriber: String,

    /// Model file passed to the transcriber
    #[serde(default)]
    pub transcriber_model: Option<PathBuf>,

    #[serde(default)]
    pub gpu_acceleration: GpuAcceleration,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_extract_timeout_secs")]
    pub extract_timeout_secs: u64,

    #[serde(default = "default_transcribe_timeout_secs")]
    pub transcribe_timeout_secs: u64,

    #[serde(default = "default_merge_timeout_secs")]
    pub merge_timeout_secs: u64,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            downloader: default_downloader(),
            ffmpeg: default_ffmpeg(),
            transcriber: default_transcriber(),
            transcriber_model: None,
            gpu_acceleration: GpuAcceleration::default(),
            download_timeout_secs: default_download_timeout_secs(),
            extract_timeout_secs: default_extract_timeout_secs(),
            transcribe_timeout_secs: default_transcribe_timeout_secs(),
            merge_timeout_secs: default_merge_timeout_secs(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    /// How translate/synthesize input is cut into segments
    #[serde(default)]
    pub segmentation_strategy: SegmentationStrategy,

    #[serde(default)]
    pub segmentation: SegmentationOptions,

    /// Total attempts per translate segment
    #[serde(default = "default_max_attempts")]
    pub translate_max_attempts: u32,

    /// Total attempts per synthesize segment
    #[serde(default = "default_max_attempts")]
    pub synthesize_max_attempts: u32,

    /// Delay after the first failed attempt, doubled on each retry
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound for a single retry delay
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Concurrent synthesis workers (2-3)
    #[serde(default = "default_synthesis_workers")]
    pub synthesis_workers: usize,

    /// How often the queue worker refreshes the running entry
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Running entries silent for longer than this are reclaimed
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segmentation_strategy: SegmentationStrategy::default(),
            segmentation: SegmentationOptions::default(),
            translate_max_attempts: default_max_attempts(),
            synthesize_max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            synthesis_workers: default_synthesis_workers(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_timeout_secs: default_stale_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    /// Retry policy for a segmented stage
    pub fn retry_policy(&self, stage: Stage) -> RetryPolicy {
        let attempts = match stage {
            Stage::Synthesizing => self.synthesize_max_attempts,
            _ => self.translate_max_attempts,
        };
        RetryPolicy::new(
            attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    /// Synthesis worker count clamped to 2..=3
    pub fn worker_count(&self) -> usize {
        self.synthesis_workers.clamp(2, 3)
    }
}

/// Log verbosity level
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_anthropic_timeout_secs() -> u64 {
    60
}

fn default_speech_timeout_secs() -> u64 {
    90
}

fn default_temperature() -> f32 {
    0.3
}

fn default_ollama_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_anthropic_endpoint() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_ollama_model() -> String {
    "llama3".to_string()
}

fn default_anthropic_model() -> String {
    "claude-3-haiku".to_string()
}

fn default_speech_model() -> String {
    "tts-1".to_string()
}

fn default_speech_voice() -> String {
    "alloy".to_string()
}

fn default_system_prompt() -> String {
    "You are a professional translator for video dubbing. Translate the user's text into {target_language}. Reply with the translation only, keeping it natural to speak aloud.".to_string()
}

fn default_downloader() -> String {
    "yt-dlp".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_transcriber() -> String {
    "whisper-cli".to_string()
}

fn default_download_timeout_secs() -> u64 {
    1800
}

fn default_extract_timeout_secs() -> u64 {
    600
}

fn default_transcribe_timeout_secs() -> u64 {
    3600
}

fn default_merge_timeout_secs() -> u64 {
    1800
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500 // doubled on each retry
}

fn default_retry_max_delay_ms() -> u64 {
    8000
}

fn default_synthesis_workers() -> usize {
    3
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_stale_timeout_secs() -> u64 {
    120
}

impl Config {
    /// Load a config file, writing the defaults there first when it does not exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            return Ok(config);
        }

        let file = File::open(path)
            .with_context(|| format!("Failed to open config file: {}", path.display()))?;
        let reader = BufReader::new(file);
        let config: Config = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let config_json =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, config_json)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration for consistency and required values
    pub fn validate(&self) -> Result<()> {
        // Validate languages
        let _target_name = crate::language_utils::get_language_name(&self.target_language)?;

        // Validate API key for remote providers
        if self.translation.provider == TranslationProvider::Anthropic
            && self.translation.get_api_key().is_empty()
        {
            return Err(anyhow!(
                "Translation API key is required for Anthropic provider"
            ));
        }
        if self.speech.api_key.is_empty() {
            return Err(anyhow!("Speech API key is required for {} provider", self.speech.provider));
        }

        url::Url::parse(&self.translation.get_endpoint())
            .with_context(|| format!("Invalid translation endpoint: {}", self.translation.get_endpoint()))?;
        url::Url::parse(&self.speech.endpoint)
            .with_context(|| format!("Invalid speech endpoint: {}", self.speech.endpoint))?;

        if !(2..=3).contains(&self.pipeline.synthesis_workers) {
            return Err(anyhow!(
                "synthesis_workers must be between 2 and 3, got {}",
                self.pipeline.synthesis_workers
            ));
        }
        if self.pipeline.translate_max_attempts == 0 || self.pipeline.synthesize_max_attempts == 0 {
            return Err(anyhow!("Retry attempt counts must be at least 1"));
        }
        if self.pipeline.heartbeat_interval_secs >= self.pipeline.stale_timeout_secs {
            return Err(anyhow!(
                "heartbeat_interval_secs must be shorter than stale_timeout_secs"
            ));
        }

        Ok(())
    }
}

/// Default implementation for Config
impl Default for Config {
    fn default() -> Self {
        Config {
            target_language: "fr".to_string(),
            database_path: None,
            workspace_dir: None,
            toolchain: ToolchainConfig::default(),
            translation: TranslationConfig::default(),
            speech: SpeechConfig::default(),
            pipeline: PipelineConfig::default(),
            log_level: LogLevel::default(),
        }
    }
}

impl TranslationConfig {
    /// Get the active provider configuration from the available_providers array
    pub fn get_active_provider_config(&self) -> Option<&ProviderConfig> {
        let provider_str = self.provider.to_lowercase_string();
        self.available_providers
            .iter()
            .find(|p| p.provider_type == provider_str)
    }

    /// Get the model for the active provider
    pub fn get_model(&self) -> String {
        if let Some(provider_config) = self.get_active_provider_config() {
            if !provider_config.model.is_empty() {
                return provider_config.model.clone();
            }
        }

        // Default fallback based on provider type
        match self.provider {
            TranslationProvider::Ollama => default_ollama_model(),
            TranslationProvider::Anthropic => default_anthropic_model(),
        }
    }

    /// Get the API key for the active provider
    pub fn get_api_key(&self) -> String {
        if let Some(provider_config) = self.get_active_provider_config() {
            if !provider_config.api_key.is_empty() {
                return provider_config.api_key.clone();
            }
        }

        // Ollama doesn't use API keys
        String::new()
    }

    /// Get the endpoint for the active provider
    pub fn get_endpoint(&self) -> String {
        if let Some(provider_config) = self.get_active_provider_config() {
            if !provider_config.endpoint.is_empty() {
                return provider_config.endpoint.clone();
            }
        }

        match self.provider {
            TranslationProvider::Ollama => default_ollama_endpoint(),
            TranslationProvider::Anthropic => default_anthropic_endpoint(),
        }
    }

    /// Get the request timeout for the active provider
    pub fn get_timeout_secs(&self) -> u64 {
        self.get_active_provider_config()
            .map(|p| p.timeout_secs)
            .unwrap_or_else(default_timeout_secs)
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            provider: TranslationProvider::default(),
            available_providers: vec![
                ProviderConfig::new(TranslationProvider::Ollama),
                ProviderConfig::new(TranslationProvider::Anthropic),
            ],
            system_prompt: default_system_prompt(),
            temperature: default_temperature(),
        }
    }
}
