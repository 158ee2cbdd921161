/*!
 * Checkpoint and recovery support.
 *
 * This module provides:
 * - Append-only segment checkpoints carrying the config in effect
 * - Failure classification and retry/backoff policy
 * - Advisory recovery plans for failed tasks
 */

pub mod classify;
pub mod manager;
pub mod models;

pub use classify::{RetryPolicy, classify_error};
pub use manager::RecoveryManager;
pub use models::{
    Checkpoint, CheckpointPayload, ConfigSnapshot, ErrorClass, RecoveryAction,
    RecoveryActionKind, RecoveryPlan,
};
