/*!
 * Mock provider implementations for testing.
 *
 * Both mocks share one behavior switch:
 * - `MockBehavior::Working` - always succeeds
 * - `MockBehavior::Failing` - always fails with a non-retryable error
 * - `MockBehavior::Transient` - fails with a timeout for the first N calls
 * - `MockBehavior::FailMatching` - fails whenever the text contains a needle
 * - `MockBehavior::Slow` - succeeds after a delay
 *
 * The behavior can be swapped at runtime so a test can make a failing
 * provider healthy before retrying.
 */

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::ProviderError;
use crate::providers::{
    SpeechRequest, SpeechSynthesizer, TranslationRequest, Translator, ensure_parent,
};

/// Behavior mode for the mock providers
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Always succeeds
    Working,
    /// Always fails with a rejected request
    Failing,
    /// Times out on the first `failures` calls, then succeeds
    Transient { failures: usize },
    /// Fails on texts containing `needle`, with a retryable error when `retryable`
    FailMatching { needle: String, retryable: bool },
    /// Sleeps before succeeding
    Slow { delay_ms: u64 },
}

#[derive(Debug)]
struct MockState {
    behavior: Mutex<MockBehavior>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl MockState {
    fn new(behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Record the call and decide its outcome
    async fn outcome(&self, text: &str) -> Result<(), ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(text.to_string());
        let behavior = self.behavior.lock().clone();

        match behavior {
            MockBehavior::Working => Ok(()),
            MockBehavior::Failing => Err(ProviderError::ApiError {
                status_code: 400,
                message: "Mock provider failure".to_string(),
            }),
            MockBehavior::Transient { failures } if call < failures => {
                Err(ProviderError::Timeout(format!("Mock timeout on call {}", call + 1)))
            }
            MockBehavior::Transient { .. } => Ok(()),
            MockBehavior::FailMatching { needle, retryable } if text.contains(&needle) => {
                if retryable {
                    Err(ProviderError::ConnectionError(format!("Mock network error for '{}'", needle)))
                } else {
                    Err(ProviderError::ApiError {
                        status_code: 422,
                        message: format!("Mock rejected '{}'", needle),
                    })
                }
            }
            MockBehavior::FailMatching { .. } => Ok(()),
            MockBehavior::Slow { delay_ms } => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(())
            }
        }
    }
}

macro_rules! mock_controls {
    ($name:ident) => {
        impl $name {
            pub fn new(behavior: MockBehavior) -> Self {
                Self {
                    state: MockState::new(behavior),
                }
            }

            pub fn working() -> Self {
                Self::new(MockBehavior::Working)
            }

            pub fn failing() -> Self {
                Self::new(MockBehavior::Failing)
            }

            pub fn transient(failures: usize) -> Self {
                Self::new(MockBehavior::Transient { failures })
            }

            pub fn fail_matching(needle: impl Into<String>, retryable: bool) -> Self {
                Self::new(MockBehavior::FailMatching {
                    needle: needle.into(),
                    retryable,
                })
            }

            pub fn slow(delay_ms: u64) -> Self {
                Self::new(MockBehavior::Slow { delay_ms })
            }

            /// Swap the behavior for subsequent calls
            pub fn set_behavior(&self, behavior: MockBehavior) {
                *self.state.behavior.lock() = behavior;
            }

            /// Number of calls made so far
            pub fn calls(&self) -> usize {
                self.state.calls.load(Ordering::SeqCst)
            }

            /// Texts received, in call order
            pub fn seen(&self) -> Vec<String> {
                self.state.seen.lock().clone()
            }
        }
    };
}

/// Mock translator; clones share their state
#[derive(Debug, Clone)]
pub struct MockTranslator {
    state: Arc<MockState>,
}

mock_controls!(MockTranslator);

#[async_trait]
impl Translator for MockTranslator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn translate(&self, request: &TranslationRequest) -> Result<String, ProviderError> {
        self.state.outcome(&request.text).await?;
        Ok(format!("[{}] {}", request.target_language, request.text))
    }
}

/// Mock speech synthesizer writing the text as the audio payload
#[derive(Debug, Clone)]
pub struct MockSynthesizer {
    state: Arc<MockState>,
}

mock_controls!(MockSynthesizer);

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn synthesize(&self, request: &SpeechRequest) -> Result<PathBuf, ProviderError> {
        self.state.outcome(&request.text).await?;
        ensure_parent(&request.output).await?;
        tokio::fs::write(&request.output, format!("AUDIO:{}", request.text))
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        Ok(request.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(text: &str) -> TranslationRequest {
        TranslationRequest {
            text: text.to_string(),
            target_language: "fr".to_string(),
            model: "mock".to_string(),
        }
    }

    #[tokio::test]
    async fn test_transient_shouldRecoverAfterFailures() {
        let mock = MockTranslator::transient(2);

        assert_eq!(mock.translate(&request("a")).await.unwrap_err().code(), "E_TIMEOUT");
        assert!(mock.translate(&request("a")).await.is_err());
        assert_eq!(mock.translate(&request("a")).await.unwrap(), "[fr] a");
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_failMatching_shouldOnlyFailMatchingText() {
        let mock = MockTranslator::fail_matching("bad", false);

        assert!(mock.translate(&request("good text")).await.is_ok());
        let err = mock.translate(&request("bad text")).await.unwrap_err();
        assert_eq!(err.code(), "E_PROVIDER_REJECTED");
    }

    #[tokio::test]
    async fn test_setBehavior_shouldAffectClones() {
        let mock = MockTranslator::failing();
        let clone = mock.clone();
        mock.set_behavior(MockBehavior::Working);

        assert!(clone.translate(&request("x")).await.is_ok());
        assert_eq!(mock.seen(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_synthesizer_shouldWriteAudioFile() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("speech/seg_0000.mp3");
        let mock = MockSynthesizer::working();

        let written = mock
            .synthesize(&SpeechRequest {
                text: "Bonjour".to_string(),
                voice: "alloy".to_string(),
                model: "tts-1".to_string(),
                output: output.clone(),
            })
            .await
            .unwrap();

        assert_eq!(written, output);
        assert_eq!(std::fs::read_to_string(output).unwrap(), "AUDIO:Bonjour");
    }
}
