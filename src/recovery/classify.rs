/*!
 * Failure classification and retry pacing.
 */

use std::time::Duration;

use super::models::ErrorClass;

/// Code prefixes of failures that are known to be transient
const TRANSIENT_CODE_PREFIXES: &[&str] = &[
    "E_NETWORK",
    "E_TIMEOUT",
    "E_RATE_LIMIT",
    "E_PROVIDER_UNAVAILABLE",
];

/// Codes that never succeed on a second attempt
const FATAL_CODE_PREFIXES: &[&str] = &["E_SEGMENT_INTEGRITY", "E_CONFIG", "E_PROVIDER_AUTH"];

/// Message fragments that indicate a transient failure
const TRANSIENT_MESSAGE_HINTS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "rate limit",
    "429",
    "502",
    "503",
    "temporarily",
];

/// Classify a failure from its code and message
///
/// Fatal codes win over everything; otherwise transient codes or wording make
/// the failure retryable. Anything unrecognized is fatal.
pub fn classify_error(code: Option<&str>, message: &str) -> ErrorClass {
    if let Some(code) = code {
        if FATAL_CODE_PREFIXES.iter().any(|p| code.starts_with(p)) {
            return ErrorClass::Fatal;
        }
        if TRANSIENT_CODE_PREFIXES.iter().any(|p| code.starts_with(p)) {
            return ErrorClass::Retryable;
        }
    }

    let message = message.to_lowercase();
    if TRANSIENT_MESSAGE_HINTS.iter().any(|hint| message.contains(hint)) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

/// Per-stage attempt budget with capped exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per segment, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before the attempt after `failed_attempt` (1-based)
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `failed_attempt` failed with `class`
    pub fn should_retry(&self, failed_attempt: u32, class: ErrorClass) -> bool {
        class == ErrorClass::Retryable && failed_attempt < self.max_attempts
    }
}
