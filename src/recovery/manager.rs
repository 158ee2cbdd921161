/*!
 * Checkpoint writing and recovery planning.
 *
 * The recovery manager records a snapshot after every segment success (and
 * on stage failure), and inspects failed segments plus the latest snapshot
 * to suggest how a failed task can be picked up again.
 */

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::database::Repository;
use crate::database::models::{SegmentRecord, SegmentStatus, StageRunStatus};
use crate::pipeline::Stage;

use super::models::{
    Checkpoint, CheckpointPayload, ConfigSnapshot, RecoveryAction, RecoveryActionKind,
    RecoveryPlan,
};

/// Length of the config hash prefix embedded in checkpoint keys
const KEY_HASH_PREFIX: usize = 16;

/// Recovery manager over the repository
#[derive(Clone)]
pub struct RecoveryManager {
    repo: Repository,
}

impl RecoveryManager {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Build the checkpoint key for a stage position
    pub fn checkpoint_key(stage: Stage, segment_id: Option<&str>, config_hash: &str) -> String {
        let prefix: String = config_hash.chars().take(KEY_HASH_PREFIX).collect();
        format!("{}#{}@{}", stage, segment_id.unwrap_or("-"), prefix)
    }

    /// Append a snapshot for a stage
    ///
    /// The payload records the config in effect and the stage's currently
    /// failed segments.
    pub async fn save_segment_checkpoint(
        &self,
        task_id: &str,
        stage: Stage,
        checkpoint_segment_id: Option<&str>,
        config: &ConfigSnapshot,
    ) -> Result<Checkpoint> {
        let failed_segment_ids: Vec<String> = self
            .repo
            .list_segments(task_id, Some(stage.as_str()))
            .await?
            .into_iter()
            .filter(|s| s.status == SegmentStatus::Failed)
            .map(|s| s.id)
            .collect();

        let config_hash = config.hash();
        let payload = CheckpointPayload {
            checkpoint_segment_id: checkpoint_segment_id.map(str::to_string),
            config_hash: config_hash.clone(),
            config: config.clone(),
            failed_segment_ids,
        };
        let key = Self::checkpoint_key(stage, checkpoint_segment_id, &config_hash);
        let json = serde_json::to_string(&payload).context("Failed to encode checkpoint")?;

        self.repo
            .insert_snapshot(task_id, stage.as_str(), &key, &json)
            .await?;
        debug!("Checkpoint {} written for task {}", key, task_id);

        let record = self
            .repo
            .latest_snapshot(task_id)
            .await?
            .context("Checkpoint disappeared after insert")?;
        Ok(Checkpoint { record, payload })
    }

    /// Latest snapshot of a task with its decoded payload
    pub async fn latest_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let Some(record) = self.repo.latest_snapshot(task_id).await? else {
            return Ok(None);
        };

        let payload: CheckpointPayload = serde_json::from_str(&record.payload)
            .with_context(|| format!("Corrupt checkpoint payload {}", record.checkpoint_key))?;
        Ok(Some(Checkpoint { record, payload }))
    }

    /// All segments of a task
    pub async fn list_segments(&self, task_id: &str) -> Result<Vec<SegmentRecord>> {
        self.repo.list_segments(task_id, None).await
    }

    /// The stage the task last failed in
    async fn failure_stage(&self, task_id: &str) -> Result<Option<Stage>> {
        let runs = self.repo.list_stage_runs(task_id).await?;
        Ok(runs
            .iter()
            .rev()
            .find(|run| matches!(run.status, StageRunStatus::Failed | StageRunStatus::Running))
            .and_then(|run| run.stage.parse().ok()))
    }

    /// Propose recovery actions for a task
    pub async fn create_plan(&self, task_id: &str, current: &ConfigSnapshot) -> Result<RecoveryPlan> {
        let mut actions = Vec::new();

        let failed = self.repo.list_failed_segments(task_id).await?;
        if !failed.is_empty() {
            let mut stages: Vec<&str> = failed.iter().map(|s| s.stage.as_str()).collect();
            stages.dedup();
            actions.push(RecoveryAction {
                kind: RecoveryActionKind::RetryFailedSegments {
                    segment_ids: failed.iter().map(|s| s.id.clone()).collect(),
                },
                label: "Retry failed segments".to_string(),
                reason: format!(
                    "{} segment(s) failed in {}",
                    failed.len(),
                    stages.join(", ")
                ),
            });
        }

        let checkpoint = match self.latest_checkpoint(task_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("Ignoring checkpoint of task {}: {}", task_id, e);
                None
            }
        };

        if let (Some(checkpoint), Some(failed_at)) =
            (checkpoint, self.failure_stage(task_id).await?)
        {
            match checkpoint.stage() {
                Some(stage) if stage <= failed_at => {
                    if checkpoint.payload.config_hash == current.hash() {
                        actions.push(RecoveryAction {
                            kind: RecoveryActionKind::ResumeFromCheckpoint {
                                stage,
                                checkpoint_key: checkpoint.record.checkpoint_key.clone(),
                            },
                            label: format!("Resume from {}", stage),
                            reason: format!(
                                "Checkpoint {} matches the current configuration",
                                checkpoint.record.checkpoint_key
                            ),
                        });
                    } else {
                        debug!(
                            "Checkpoint of task {} was written under a different configuration",
                            task_id
                        );
                    }
                }
                _ => {}
            }
        }

        Ok(RecoveryPlan {
            task_id: task_id.to_string(),
            actions,
        })
    }
}
