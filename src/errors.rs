/*!
 * Error types for the dubpipe pipeline.
 *
 * This module contains the typed errors raised by collaborators (providers,
 * external processes, the toolchain) and by the pipeline itself, using the
 * thiserror crate for ergonomic error definitions.
 */

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when working with provider APIs
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Error when making an API request fails
    #[error("API request failed: {0}")]
    RequestFailed(String),

    /// Error when parsing an API response fails
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Error returned by the API itself
    #[error("API responded with error: {status_code} - {message}")]
    ApiError {
        /// HTTP status code
        status_code: u16,
        /// Error message from the API
        message: String,
    },

    /// Error establishing or maintaining a connection
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error related to rate limiting
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Error with authentication
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// The request did not finish in time
    #[error("Request timed out: {0}")]
    Timeout(String),
}

impl ProviderError {
    /// Stable error code used for classification and persistence
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::RequestFailed(_) => "E_PROVIDER_REQUEST",
            ProviderError::ParseError(_) => "E_PROVIDER_RESPONSE",
            ProviderError::ApiError { status_code, .. } if *status_code >= 500 => {
                "E_PROVIDER_UNAVAILABLE"
            }
            ProviderError::ApiError { status_code: 429, .. } => "E_RATE_LIMIT",
            ProviderError::ApiError { .. } => "E_PROVIDER_REJECTED",
            ProviderError::ConnectionError(_) => "E_NETWORK",
            ProviderError::RateLimitExceeded(_) => "E_RATE_LIMIT",
            ProviderError::AuthenticationError(_) => "E_PROVIDER_AUTH",
            ProviderError::Timeout(_) => "E_TIMEOUT",
        }
    }

    /// Map a reqwest transport error onto the provider taxonomy
    pub fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Timeout(error.to_string())
        } else if error.is_connect() {
            ProviderError::ConnectionError(error.to_string())
        } else {
            ProviderError::RequestFailed(error.to_string())
        }
    }
}

/// Errors raised while running an external command
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The program could not be started at all
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran but exited unsuccessfully
    #[error("{program} exited with status {}: {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()), .stderr_tail.join(" | "))]
    Exited {
        program: String,
        code: Option<i32>,
        /// Last lines written to stdout
        stdout_tail: Vec<String>,
        /// Last lines written to stderr
        stderr_tail: Vec<String>,
    },

    /// The program exceeded its time budget and was terminated
    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    /// The run was canceled and the program was terminated
    #[error("{program} was canceled")]
    Canceled { program: String },

    /// Reading the child output failed
    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while resolving external tools
#[derive(Error, Debug)]
pub enum ToolchainError {
    /// A required program is neither configured nor on PATH
    #[error("Required tool '{tool}' not found (looked for '{program}')")]
    NotFound { tool: &'static str, program: String },

    /// A configured model file is missing
    #[error("Transcription model not found at {0}")]
    MissingModel(PathBuf),
}

/// Errors raised by the pipeline scheduler and its stage handlers
#[derive(Error, Debug)]
pub enum PipelineError {
    /// No task with this id exists
    #[error("Task {0} not found")]
    TaskNotFound(String),

    /// The run was canceled cooperatively
    #[error("Task was canceled")]
    Canceled,

    /// Segmentation lost or altered text
    #[error("Segment integrity violated: {0}")]
    Integrity(String),

    /// One segment exhausted its attempts or failed fatally
    #[error("Segment {segment_id} failed ({code}): {message}")]
    SegmentFailed {
        /// Stage-level code the failure is promoted to
        code: String,
        segment_id: String,
        message: String,
    },

    /// A previous stage did not leave the artifact this stage needs
    #[error("Missing {kind} artifact for task {task_id}")]
    MissingArtifact { task_id: String, kind: String },

    /// Invalid request or configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An external command failed
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// A provider client failed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Tool resolution failed
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    /// File system error in the task workspace
    #[error("Workspace I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistence layer error
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether this error represents cooperative cancellation
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            PipelineError::Canceled | PipelineError::Process(ProcessError::Canceled { .. })
        )
    }

    /// The error code recorded on the task when this error ends `stage_code`'s stage
    pub fn stage_code(&self, stage_code: &str) -> String {
        match self {
            PipelineError::SegmentFailed { code, .. } => code.clone(),
            PipelineError::Integrity(_) => "E_SEGMENT_INTEGRITY".to_string(),
            _ => stage_code.to_string(),
        }
    }
}

/// Errors raised by the task queue
#[derive(Error, Debug)]
pub enum QueueError {
    /// The task is already waiting or running
    #[error("Task {0} is already queued")]
    Duplicate(String),

    /// No task with this id exists
    #[error("Task {0} does not exist")]
    UnknownTask(String),

    /// The task has no queue entry
    #[error("Task {0} is not in the queue")]
    NotFound(String),

    /// The operation needs a waiting entry
    #[error("Task {0} is not waiting")]
    NotWaiting(String),

    /// Another entry already occupies the single worker
    #[error("Task {running} is already running; cannot start {requested}")]
    AlreadyRunning { running: String, requested: String },

    /// Persistence layer error
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

// Utility conversions for the binary glue
impl From<QueueError> for PipelineError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Storage(e) => PipelineError::Storage(e),
            other => PipelineError::Config(other.to_string()),
        }
    }
}
