/*!
 * # dubpipe - resumable video dubbing pipeline
 *
 * A Rust library that turns a video into a dubbed copy in another language.
 *
 * ## Features
 *
 * - Download remote videos or copy local media into a per-task workspace
 * - Extract audio and transcribe it with an external speech recognizer
 * - Translate the transcript segment by segment using AI providers:
 *   - Ollama (local LLM)
 *   - Anthropic API
 * - Synthesize the translation with a text-to-speech provider
 * - Merge the new speech track back into the video
 * - Persist every stage, segment and checkpoint in SQLite so failed tasks can
 *   retry single segments or resume from their last checkpoint
 * - A priority queue feeding a single pipeline worker
 *
 * ## Architecture
 *
 * The library is organized in these main modules:
 * - `app_config`: Configuration management
 * - `app_controller`: Queue worker wiring storage, providers and the scheduler
 * - `database`: SQLite persistence of tasks, segments, snapshots and the queue
 * - `pipeline`: The stage scheduler and its event stream
 * - `recovery`: Checkpoints, failure classification and recovery plans
 * - `queue`: Priority backlog of tasks
 * - `segmentation`: Splitting transcripts into translatable segments
 * - `providers`: Translation and speech provider clients
 * - `toolchain` / `process_runner`: External media tools and how they are run
 * - `workspace`: Per-task working directories
 * - `language_utils`: ISO language code utilities
 * - `errors`: Custom error types for the application
 */

// Global lints configuration
// These lints will be allowed but not auto-fixed
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]

// Public modules
pub mod app_config;
pub mod app_controller;
pub mod database;
pub mod errors;
pub mod language_utils;
pub mod pipeline;
pub mod process_runner;
pub mod providers;
pub mod queue;
pub mod recovery;
pub mod segmentation;
pub mod toolchain;
pub mod workspace;

// Re-export main types for easier usage
pub use app_config::Config;
pub use app_controller::{Controller, SubmitOptions};
pub use errors::{PipelineError, ProviderError, QueueError};
pub use pipeline::{EventSink, PipelineEvent, RunOutcome, Scheduler, Stage};
pub use queue::TaskQueue;
pub use recovery::{RecoveryManager, RecoveryPlan};
