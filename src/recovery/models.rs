/*!
 * Checkpoint payloads and recovery plan types.
 */

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::database::models::{RecoverySnapshotRecord, TaskRecord};
use crate::pipeline::Stage;
use crate::segmentation::{SegmentationOptions, SegmentationStrategy};

/// Settings that determine what a segmented stage produces
///
/// Two runs with the same snapshot produce interchangeable segment results,
/// so a checkpoint is only safe to resume from while the hash matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub target_language: String,
    pub translate_provider: String,
    pub translate_model: String,
    pub speech_provider: String,
    pub speech_voice: String,
    pub segmentation_strategy: SegmentationStrategy,
    pub segmentation_options: SegmentationOptions,
}

impl ConfigSnapshot {
    /// Snapshot a task's provider settings with the active segmentation settings
    pub fn for_task(
        task: &TaskRecord,
        strategy: SegmentationStrategy,
        options: &SegmentationOptions,
    ) -> Self {
        Self {
            target_language: task.target_language.clone(),
            translate_provider: task.translate_provider.clone(),
            translate_model: task.translate_model.clone(),
            speech_provider: task.speech_provider.clone(),
            speech_voice: task.speech_voice.clone(),
            segmentation_strategy: strategy,
            segmentation_options: options.clone(),
        }
    }

    /// Hex SHA-256 of the JSON form
    pub fn hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// JSON payload stored in a recovery snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointPayload {
    /// Segment whose success produced this checkpoint, absent for stage-failure snapshots
    pub checkpoint_segment_id: Option<String>,
    pub config_hash: String,
    pub config: ConfigSnapshot,
    /// Segments of the stage that were failed when the checkpoint was written
    #[serde(default)]
    pub failed_segment_ids: Vec<String>,
}

/// A stored snapshot with its decoded payload
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub record: RecoverySnapshotRecord,
    pub payload: CheckpointPayload,
}

impl Checkpoint {
    /// The stage the checkpoint belongs to, if it names a known stage
    pub fn stage(&self) -> Option<Stage> {
        self.record.stage.parse().ok()
    }
}

/// How a failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient; the attempt may be repeated
    Retryable,
    /// Permanent; retrying cannot help
    Fatal,
}

/// The remedial step an action proposes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecoveryActionKind {
    #[serde(rename_all = "camelCase")]
    RetryFailedSegments { segment_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    ResumeFromCheckpoint { stage: Stage, checkpoint_key: String },
}

/// One suggested action with a human-readable explanation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAction {
    #[serde(flatten)]
    pub kind: RecoveryActionKind,
    pub label: String,
    pub reason: String,
}

/// Advisory recovery suggestions for a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub task_id: String,
    pub actions: Vec<RecoveryAction>,
}

impl RecoveryPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Segment ids named by a retry action, if any
    pub fn failed_segment_ids(&self) -> Option<&[String]> {
        self.actions.iter().find_map(|action| match &action.kind {
            RecoveryActionKind::RetryFailedSegments { segment_ids } => Some(segment_ids.as_slice()),
            _ => None,
        })
    }
}
