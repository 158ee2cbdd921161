/*!
 * Tests for error codes and how failures are classified
 */

use dubpipe::errors::{PipelineError, ProcessError, ProviderError};
use dubpipe::recovery::{ErrorClass, classify_error};

/// Provider failures must classify the same way the segment loop sees them
#[test]
fn test_providerErrors_shouldClassifyByCode() {
    let cases = [
        (ProviderError::Timeout("slow".into()), ErrorClass::Retryable),
        (ProviderError::ConnectionError("reset".into()), ErrorClass::Retryable),
        (ProviderError::RateLimitExceeded("busy".into()), ErrorClass::Retryable),
        (
            ProviderError::ApiError {
                status_code: 503,
                message: "down".into(),
            },
            ErrorClass::Retryable,
        ),
        (
            ProviderError::ApiError {
                status_code: 400,
                message: "bad input".into(),
            },
            ErrorClass::Fatal,
        ),
        (ProviderError::AuthenticationError("no key".into()), ErrorClass::Fatal),
        (ProviderError::ParseError("garbage".into()), ErrorClass::Fatal),
    ];

    for (error, expected) in cases {
        let class = classify_error(Some(error.code()), &error.to_string());
        assert_eq!(class, expected, "unexpected class for {}", error.code());
    }
}

#[test]
fn test_apiError_statusCodes_shouldMapToDistinctCodes() {
    let code = |status_code| {
        ProviderError::ApiError {
            status_code,
            message: String::new(),
        }
        .code()
    };
    assert_eq!(code(429), "E_RATE_LIMIT");
    assert_eq!(code(500), "E_PROVIDER_UNAVAILABLE");
    assert_eq!(code(404), "E_PROVIDER_REJECTED");
}

#[test]
fn test_stageCode_segmentFailure_shouldKeepPromotedCode() {
    let error = PipelineError::SegmentFailed {
        code: "E_TTS_SEGMENT_FAILED".into(),
        segment_id: "seg".into(),
        message: "boom".into(),
    };
    assert_eq!(error.stage_code("E_TTS_FAILED"), "E_TTS_SEGMENT_FAILED");

    let integrity = PipelineError::Integrity("lost text".into());
    assert_eq!(integrity.stage_code("E_TRANSLATE_FAILED"), "E_SEGMENT_INTEGRITY");

    let io = PipelineError::Config("bad".into());
    assert_eq!(io.stage_code("E_MERGE_FAILED"), "E_MERGE_FAILED");
}

#[test]
fn test_isCanceled_shouldCoverProcessCancellation() {
    assert!(PipelineError::Canceled.is_canceled());
    assert!(
        PipelineError::from(ProcessError::Canceled {
            program: "ffmpeg".into()
        })
        .is_canceled()
    );
    assert!(
        !PipelineError::from(ProcessError::Timeout {
            program: "ffmpeg".into(),
            seconds: 5
        })
        .is_canceled()
    );
}

#[test]
fn test_classifyError_integrityCode_shouldBeFatalEvenWithTransientWording() {
    assert_eq!(
        classify_error(Some("E_SEGMENT_INTEGRITY"), "network timeout"),
        ErrorClass::Fatal
    );
    assert_eq!(classify_error(None, "Connection refused"), ErrorClass::Retryable);
    assert_eq!(classify_error(None, "something odd"), ErrorClass::Fatal);
}
