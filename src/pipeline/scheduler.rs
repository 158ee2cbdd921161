/*!
 * The stage scheduler.
 *
 * A scheduler owns at most one active run. `start` checks the single-run
 * rule, marks the task queued and spawns the run; the run walks the stages
 * from its resume point, records a stage run per attempt and reports
 * through the event sink. Cancellation trips the run's token, which every
 * stage checks before work and around each external call.
 */

use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use anyhow::Context;
use log::{Level, error, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app_config::PipelineConfig;
use crate::database::Repository;
use crate::database::models::{ArtifactKind, SegmentRecord, StageRunStatus, TaskRecord, TaskStatus};
use crate::errors::PipelineError;
use crate::providers::{SpeechSynthesizer, Translator};
use crate::recovery::{ConfigSnapshot, RecoveryManager, RecoveryPlan};
use crate::workspace::{TaskPaths, Workspace};

use super::context::ExecutionContext;
use super::events::{EventSink, PipelineEvent, overall_percent};
use super::media::MediaToolkit;
use super::Stage;

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed {
        stage: Option<Stage>,
        code: String,
        message: String,
    },
    Canceled,
}

/// Answer to a start request
#[derive(Debug)]
pub struct StartOutcome {
    pub accepted: bool,
    /// Why the request was turned down
    pub reason: Option<String>,
    /// The spawned run, when accepted
    pub handle: Option<JoinHandle<RunOutcome>>,
}

impl StartOutcome {
    fn accepted(handle: JoinHandle<RunOutcome>) -> Self {
        Self {
            accepted: true,
            reason: None,
            handle: Some(handle),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
            handle: None,
        }
    }

    /// Wait for the run, if one was started
    pub async fn wait(self) -> Option<RunOutcome> {
        match self.handle {
            Some(handle) => match handle.await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!("Pipeline run panicked: {}", e);
                    None
                }
            },
            None => None,
        }
    }
}

#[derive(Debug)]
struct ActiveRun {
    task_id: String,
    cancel: CancellationToken,
}

/// Drives tasks through the six stages
#[derive(Clone)]
pub struct Scheduler {
    pub(super) repo: Repository,
    pub(super) recovery: RecoveryManager,
    pub(super) media: Arc<dyn MediaToolkit>,
    pub(super) translator: Arc<dyn Translator>,
    pub(super) synthesizer: Arc<dyn SpeechSynthesizer>,
    pub(super) config: PipelineConfig,
    /// Speech model passed to the synthesizer
    pub(super) speech_model: String,
    pub(super) workspace: Workspace,
    pub(super) events: EventSink,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Repository,
        media: Arc<dyn MediaToolkit>,
        translator: Arc<dyn Translator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        config: PipelineConfig,
        speech_model: impl Into<String>,
        workspace: Workspace,
        events: EventSink,
    ) -> Self {
        Self {
            recovery: RecoveryManager::new(repo.clone()),
            repo,
            media,
            translator,
            synthesizer,
            config,
            speech_model: speech_model.into(),
            workspace,
            events,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Id of the task currently running, if any
    pub fn active_task(&self) -> Option<String> {
        self.active.lock().as_ref().map(|run| run.task_id.clone())
    }

    /// Start a task from its first stage
    pub async fn start(&self, task_id: &str) -> Result<StartOutcome, PipelineError> {
        self.start_with(ExecutionContext::new(task_id)).await
    }

    /// Start a run described by `ctx`
    pub async fn start_with(&self, ctx: ExecutionContext) -> Result<StartOutcome, PipelineError> {
        let task = self.load_task(&ctx.task_id).await?;

        {
            let mut active = self.active.lock();
            if let Some(run) = active.as_ref() {
                let reason = if run.task_id == task.id {
                    format!("Task {} is already running", task.id)
                } else {
                    format!("Task {} is running; only one task runs at a time", run.task_id)
                };
                return Ok(StartOutcome::rejected(reason));
            }
            if task.status.is_running() {
                return Ok(StartOutcome::rejected(format!(
                    "Task {} is already {}",
                    task.id, task.status
                )));
            }
            *active = Some(ActiveRun {
                task_id: task.id.clone(),
                cancel: ctx.cancel.clone(),
            });
        }

        if let Err(e) = self
            .repo
            .update_task_status(&task.id, TaskStatus::Queued, None)
            .await
        {
            self.release(&task.id);
            return Err(e.into());
        }
        self.emit_status(&task.id, TaskStatus::Queued, None);
        info!(
            "Starting task {} at {}",
            task.id,
            ctx.first_stage()
        );

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let task_id = ctx.task_id.clone();
            let outcome = scheduler.run(ctx).await;
            scheduler.release(&task_id);
            outcome
        });
        Ok(StartOutcome::accepted(handle))
    }

    /// Cancel a queued or running task
    pub async fn cancel(&self, task_id: &str) -> Result<bool, PipelineError> {
        let tripped = {
            let active = self.active.lock();
            match active.as_ref() {
                Some(run) if run.task_id == task_id => {
                    run.cancel.cancel();
                    true
                }
                _ => false,
            }
        };

        let task = self.load_task(task_id).await?;
        if task.status == TaskStatus::Queued {
            self.repo
                .update_task_status(task_id, TaskStatus::Canceled, None)
                .await?;
            self.emit_status(task_id, TaskStatus::Canceled, None);
            info!("Canceled queued task {}", task_id);
            return Ok(true);
        }

        if tripped {
            info!("Cancellation requested for task {}", task_id);
        }
        Ok(tripped)
    }

    /// Re-run the given segments, resuming at the earliest stage they belong to
    pub async fn retry_segments(
        &self,
        task_id: &str,
        segment_ids: &[String],
    ) -> Result<StartOutcome, PipelineError> {
        let segments = self.repo.get_segments_by_ids(task_id, segment_ids).await?;
        if segments.is_empty() {
            return Ok(StartOutcome::rejected(format!(
                "None of the given segments belong to task {}",
                task_id
            )));
        }

        let stage = if segments
            .iter()
            .any(|s| s.stage == Stage::Translating.as_str())
        {
            Stage::Translating
        } else {
            Stage::Synthesizing
        };

        let ctx = ExecutionContext::new(task_id)
            .resume_from(stage)
            .with_retry_set(segments.into_iter().map(|s| s.id));
        self.start_with(ctx).await
    }

    /// Resume at the stage of the latest checkpoint
    pub async fn resume_from_checkpoint(&self, task_id: &str) -> Result<StartOutcome, PipelineError> {
        let task = self.load_task(task_id).await?;
        let Some(checkpoint) = self.recovery.latest_checkpoint(task_id).await? else {
            return Ok(StartOutcome::rejected(format!(
                "Task {} has no checkpoint",
                task_id
            )));
        };

        let stage = checkpoint.stage().ok_or_else(|| {
            PipelineError::Config(format!(
                "Checkpoint {} names unknown stage '{}'",
                checkpoint.record.checkpoint_key, checkpoint.record.stage
            ))
        })?;

        let mut ctx = ExecutionContext::new(task_id).resume_from(stage);
        if checkpoint.payload.config_hash == self.config_snapshot(&task).hash() {
            ctx = ctx.with_retry_set(checkpoint.payload.failed_segment_ids);
        } else {
            warn!(
                "Configuration changed since checkpoint {}; restarting {} from scratch",
                checkpoint.record.checkpoint_key, stage
            );
        }
        self.start_with(ctx).await
    }

    pub async fn list_segments(&self, task_id: &str) -> Result<Vec<SegmentRecord>, PipelineError> {
        Ok(self.recovery.list_segments(task_id).await?)
    }

    pub async fn get_recovery_plan(&self, task_id: &str) -> Result<RecoveryPlan, PipelineError> {
        let task = self.load_task(task_id).await?;
        Ok(self
            .recovery
            .create_plan(task_id, &self.config_snapshot(&task))
            .await?)
    }

    /// The settings a checkpoint of this task is only valid under
    pub fn config_snapshot(&self, task: &TaskRecord) -> ConfigSnapshot {
        ConfigSnapshot::for_task(
            task,
            self.config.segmentation_strategy,
            &self.config.segmentation,
        )
    }

    pub(super) async fn load_task(&self, task_id: &str) -> Result<TaskRecord, PipelineError> {
        self.repo
            .get_task(task_id)
            .await?
            .ok_or_else(|| PipelineError::TaskNotFound(task_id.to_string()))
    }

    fn release(&self, task_id: &str) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|run| run.task_id == task_id) {
            *active = None;
        }
    }

    pub(super) fn emit_status(&self, task_id: &str, status: TaskStatus, stage: Option<Stage>) {
        self.events.emit(PipelineEvent::Status {
            task_id: task_id.to_string(),
            status,
            stage,
        });
    }

    pub(super) fn emit_progress(&self, task_id: &str, stage: Stage, fraction: f64, message: String) {
        self.events.emit(PipelineEvent::Progress {
            task_id: task_id.to_string(),
            stage,
            percent: overall_percent(stage, fraction),
            message,
        });
    }

    async fn run(&self, ctx: ExecutionContext) -> RunOutcome {
        let task = match self.load_task(&ctx.task_id).await {
            Ok(task) => task,
            Err(e) => return self.fail_run(&ctx.task_id, None, "E_STORAGE".to_string(), e).await,
        };
        let paths = match self.workspace.ensure_task_dir(&task.id) {
            Ok(paths) => paths,
            Err(e) => {
                let stage = ctx.first_stage();
                return self
                    .fail_run(&task.id, Some(stage), stage.failure_code().to_string(), e.into())
                    .await;
            }
        };

        for &stage in ctx.first_stage().remaining() {
            if ctx.cancel.is_cancelled() {
                return self.cancel_run(&task.id, None).await;
            }

            let run_id = match self.enter_stage(&task.id, stage).await {
                Ok(run_id) => run_id,
                Err(e) => {
                    return self
                        .fail_run(&task.id, Some(stage), stage.failure_code().to_string(), e)
                        .await;
                }
            };

            let retries = AtomicU32::new(0);
            let result = self.run_stage(stage, &task, &paths, &ctx, &retries).await;
            let retries = i64::from(retries.into_inner());

            match result {
                Ok(()) => {
                    if let Err(e) = self
                        .repo
                        .finish_stage_run(run_id, StageRunStatus::Success, retries, None)
                        .await
                    {
                        return self
                            .fail_run(&task.id, Some(stage), stage.failure_code().to_string(), e.into())
                            .await;
                    }
                    self.emit_progress(&task.id, stage, 1.0, format!("{} finished", stage));
                }
                Err(_) if ctx.cancel.is_cancelled() => {
                    return self.cancel_run(&task.id, Some(run_id)).await;
                }
                Err(e) if e.is_canceled() => {
                    return self.cancel_run(&task.id, Some(run_id)).await;
                }
                Err(e) => {
                    let code = e.stage_code(stage.failure_code());
                    if let Err(finish_err) = self
                        .repo
                        .finish_stage_run(
                            run_id,
                            StageRunStatus::Failed,
                            retries,
                            Some((code.clone(), e.to_string())),
                        )
                        .await
                    {
                        error!("Failed to record stage failure: {}", finish_err);
                    }
                    if stage.is_segmented() {
                        let config = self.config_snapshot(&task);
                        if let Err(cp_err) = self
                            .recovery
                            .save_segment_checkpoint(&task.id, stage, None, &config)
                            .await
                        {
                            warn!("Failed to write failure checkpoint: {}", cp_err);
                        }
                    }
                    return self.fail_run(&task.id, Some(stage), code, e).await;
                }
            }
        }

        self.complete_run(&task.id).await
    }

    async fn enter_stage(&self, task_id: &str, stage: Stage) -> Result<i64, PipelineError> {
        let run_id = self.repo.start_stage_run(task_id, stage.as_str()).await?;
        self.repo
            .update_task_status(task_id, stage.task_status(), None)
            .await?;
        self.emit_status(task_id, stage.task_status(), Some(stage));
        self.emit_progress(task_id, stage, 0.0, format!("{} started", stage));
        info!("Task {} entered {}", task_id, stage);
        Ok(run_id)
    }

    async fn complete_run(&self, task_id: &str) -> RunOutcome {
        if let Err(e) = self
            .repo
            .update_task_status(task_id, TaskStatus::Completed, None)
            .await
        {
            return self.fail_run(task_id, None, "E_STORAGE".to_string(), e.into()).await;
        }

        let output = match self.repo.get_artifact(task_id, ArtifactKind::Output).await {
            Ok(artifact) => artifact.map(|a| a.path),
            Err(e) => {
                warn!("Could not read output artifact of {}: {}", task_id, e);
                None
            }
        };
        self.emit_status(task_id, TaskStatus::Completed, None);
        self.events.emit(PipelineEvent::Completed {
            task_id: task_id.to_string(),
            output,
        });
        info!("Task {} completed", task_id);
        RunOutcome::Completed
    }

    async fn cancel_run(&self, task_id: &str, run_id: Option<i64>) -> RunOutcome {
        if let Some(run_id) = run_id {
            if let Err(e) = self
                .repo
                .finish_stage_run(run_id, StageRunStatus::Skipped, 0, None)
                .await
            {
                error!("Failed to close canceled stage run: {}", e);
            }
        }
        if let Err(e) = self
            .repo
            .update_task_status(task_id, TaskStatus::Canceled, None)
            .await
        {
            error!("Failed to mark task {} canceled: {}", task_id, e);
        }
        self.emit_status(task_id, TaskStatus::Canceled, None);
        self.events.log(task_id, Level::Info, "Task canceled");
        RunOutcome::Canceled
    }

    async fn fail_run(
        &self,
        task_id: &str,
        stage: Option<Stage>,
        code: String,
        error: PipelineError,
    ) -> RunOutcome {
        let message = error.to_string();
        error!("Task {} failed ({}): {}", task_id, code, message);

        if let Err(e) = self
            .repo
            .update_task_status(
                task_id,
                TaskStatus::Failed,
                Some((code.clone(), message.clone())),
            )
            .await
        {
            error!("Failed to mark task {} failed: {}", task_id, e);
        }
        self.emit_status(task_id, TaskStatus::Failed, stage);
        self.events.emit(PipelineEvent::Failed {
            task_id: task_id.to_string(),
            stage,
            error_code: code.clone(),
            error_message: message.clone(),
        });

        match self.get_recovery_plan(task_id).await {
            Ok(plan) if !plan.is_empty() => {
                self.events.emit(PipelineEvent::RecoverySuggested {
                    task_id: task_id.to_string(),
                    plan,
                });
            }
            Ok(_) => {}
            Err(e) => warn!("Could not build recovery plan for {}: {}", task_id, e),
        }

        RunOutcome::Failed {
            stage,
            code,
            message,
        }
    }

    /// Path of an artifact a previous stage must have produced
    pub(super) async fn require_artifact(
        &self,
        task_id: &str,
        kind: ArtifactKind,
    ) -> Result<std::path::PathBuf, PipelineError> {
        let artifact = self
            .repo
            .get_artifact(task_id, kind)
            .await
            .with_context(|| format!("Failed to read {} artifact", kind))?
            .ok_or_else(|| PipelineError::MissingArtifact {
                task_id: task_id.to_string(),
                kind: kind.to_string(),
            })?;
        Ok(std::path::PathBuf::from(artifact.path))
    }

    pub(super) async fn record_artifact(
        &self,
        task_id: &str,
        kind: ArtifactKind,
        path: &std::path::Path,
    ) -> Result<(), PipelineError> {
        self.repo
            .put_artifact(task_id, kind, &path.to_string_lossy())
            .await?;
        Ok(())
    }

    /// Dispatch one stage, counting the retries it spends into `retries`
    async fn run_stage(
        &self,
        stage: Stage,
        task: &TaskRecord,
        paths: &TaskPaths,
        ctx: &ExecutionContext,
        retries: &AtomicU32,
    ) -> Result<(), PipelineError> {
        ctx.check_canceled()?;
        match stage {
            Stage::Downloading => self.download_stage(task, paths, ctx).await,
            Stage::Extracting => self.extract_stage(task, paths, ctx).await,
            Stage::Transcribing => self.transcribe_stage(task, paths, ctx).await,
            Stage::Translating => self.translate_stage(task, paths, ctx, retries).await,
            Stage::Synthesizing => self.synthesize_stage(task, paths, ctx, retries).await,
            Stage::Merging => self.merge_stage(task, paths, ctx).await,
        }
    }
}
