use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::app_config::Config;
use crate::database::models::{QueueStatus, TaskRecord, TaskStatus};
use crate::database::{DatabaseConnection, QueueStatusPatch, Repository};
use crate::language_utils;
use crate::pipeline::{
    CommandMediaToolkit, EventSink, MediaToolkit, RunOutcome, Scheduler,
};
use crate::process_runner::ProcessRunner;
use crate::providers::{self, SpeechSynthesizer, Translator};
use crate::queue::TaskQueue;
use crate::toolchain::Toolchain;
use crate::workspace::Workspace;

// @module: Application controller wiring storage, providers and the scheduler

/// Queue entry code for a canceled run
pub const CANCELED_CODE: &str = "E_CANCELED";
/// Task code for a run whose worker disappeared
pub const WORKER_LOST_CODE: &str = "E_WORKER_LOST";
/// Queue entry code for a start request the scheduler turned down
pub const START_REJECTED_CODE: &str = "E_START_REJECTED";

// @struct: Options for a new task
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    // @field: Overrides the configured target language
    pub target_language: Option<String>,
    // @field: Overrides the configured voice
    pub voice: Option<String>,
    // @field: Queue priority, higher first
    pub priority: i64,
    // @field: Optional batch grouping
    pub batch_id: Option<String>,
    // @field: Put the task in the queue right away
    pub enqueue: bool,
}

/// Main application controller for dubbing tasks
pub struct Controller {
    // @field: App configuration
    config: Config,
    repo: Repository,
    queue: TaskQueue,
    scheduler: Scheduler,
}

impl Controller {
    // @method: Build everything from the configuration
    pub fn with_config(config: Config, events: EventSink) -> Result<Self> {
        let repo = open_repository(&config)?;
        let workspace = match &config.workspace_dir {
            Some(dir) => Workspace::new(dir),
            None => Workspace::new_default()?,
        };

        let toolchain =
            Toolchain::resolve(&config.toolchain).context("Failed to resolve external tools")?;
        let media: Arc<dyn MediaToolkit> =
            Arc::new(CommandMediaToolkit::new(toolchain, ProcessRunner::new()));
        let translator = providers::translator_from_config(&config.translation);
        let synthesizer = providers::synthesizer_from_config(&config.speech);

        Ok(Self::with_parts(
            config,
            repo,
            media,
            translator,
            synthesizer,
            workspace,
            events,
        ))
    }

    // @method: Build from explicit collaborators
    pub fn with_parts(
        config: Config,
        repo: Repository,
        media: Arc<dyn MediaToolkit>,
        translator: Arc<dyn Translator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        workspace: Workspace,
        events: EventSink,
    ) -> Self {
        let scheduler = Scheduler::new(
            repo.clone(),
            media,
            translator,
            synthesizer,
            config.pipeline.clone(),
            config.speech.model.clone(),
            workspace,
            events,
        );
        Self {
            queue: TaskQueue::new(repo.clone()),
            config,
            repo,
            scheduler,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Create a task for `source` and optionally enqueue it
    pub async fn submit(&self, source: &str, options: SubmitOptions) -> Result<TaskRecord> {
        submit_task(&self.config, &self.repo, &self.queue, source, options).await
    }

    /// Requeue running entries that stopped heartbeating and fail their tasks
    ///
    /// Also fails tasks left in an active status with no run behind them, so
    /// they can be retried or resumed.
    pub async fn reclaim_stale(&self) -> Result<Vec<String>> {
        let timeout = Duration::from_secs(self.config.pipeline.stale_timeout_secs);
        let stale: Vec<String> = self
            .queue
            .list_stale_running_tasks(timeout)
            .await?
            .into_iter()
            .map(|entry| entry.task_id)
            .collect();

        let requeued = self.queue.requeue_tasks(&stale).await?;
        for task_id in &requeued {
            warn!("Reclaimed stale task {}", task_id);
        }

        let active = self.scheduler.active_task();
        for task in self.repo.list_tasks(None).await? {
            if task.status.is_running() && active.as_deref() != Some(task.id.as_str()) {
                self.repo
                    .update_task_status(
                        &task.id,
                        TaskStatus::Failed,
                        Some((
                            WORKER_LOST_CODE.to_string(),
                            format!("Run was interrupted while {}", task.status),
                        )),
                    )
                    .await?;
                warn!("Task {} was interrupted while {}", task.id, task.status);
            }
        }

        Ok(requeued)
    }

    /// Claim and run the next waiting task; None when the queue is empty
    pub async fn run_next(&self, shutdown: &CancellationToken) -> Result<Option<(String, RunOutcome)>> {
        let Some(entry) = self.queue.dequeue_next(1).await?.into_iter().next() else {
            return Ok(None);
        };
        let task_id = entry.task_id;

        self.queue
            .update_queue_status(
                &task_id,
                QueueStatus::Running,
                QueueStatusPatch {
                    worker_slot: Some(0),
                    ..Default::default()
                },
            )
            .await?;

        let started = match self.scheduler.start(&task_id).await {
            Ok(started) if started.accepted => started,
            Ok(rejected) => {
                let reason = rejected.reason.unwrap_or_default();
                warn!("Task {} was not started: {}", task_id, reason);
                self.finish_entry(&task_id, QueueStatus::Failed, Some(START_REJECTED_CODE))
                    .await?;
                return Ok(Some((
                    task_id,
                    RunOutcome::Failed {
                        stage: None,
                        code: START_REJECTED_CODE.to_string(),
                        message: reason,
                    },
                )));
            }
            Err(e) => {
                self.finish_entry(&task_id, QueueStatus::Failed, Some(START_REJECTED_CODE))
                    .await?;
                return Err(e.into());
            }
        };

        let Some(mut handle) = started.handle else {
            return Err(anyhow!("Accepted start of {} carried no run", task_id));
        };

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.pipeline.heartbeat_interval_secs.max(1)));
        ticker.tick().await;
        let mut cancel_sent = false;

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.heartbeat(&task_id).await {
                        warn!("Heartbeat for {} failed: {}", task_id, e);
                    }
                }
                _ = shutdown.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    info!("Shutdown requested; canceling task {}", task_id);
                    if let Err(e) = self.scheduler.cancel(&task_id).await {
                        error!("Failed to cancel {}: {}", task_id, e);
                    }
                }
            }
        };

        let outcome = joined.unwrap_or_else(|e| RunOutcome::Failed {
            stage: None,
            code: "E_WORKER_PANIC".to_string(),
            message: e.to_string(),
        });

        match &outcome {
            RunOutcome::Completed => {
                self.finish_entry(&task_id, QueueStatus::Completed, None).await?;
            }
            RunOutcome::Failed { code, .. } => {
                self.finish_entry(&task_id, QueueStatus::Failed, Some(code)).await?;
            }
            RunOutcome::Canceled => {
                self.finish_entry(&task_id, QueueStatus::Failed, Some(CANCELED_CODE))
                    .await?;
            }
        }

        Ok(Some((task_id, outcome)))
    }

    /// Run queued tasks one at a time until the queue is empty or shutdown trips
    pub async fn drain(&self, shutdown: &CancellationToken) -> Result<Vec<(String, RunOutcome)>> {
        let reclaimed = self.reclaim_stale().await?;
        if !reclaimed.is_empty() {
            info!("Requeued {} stale task(s)", reclaimed.len());
        }

        let mut finished = Vec::new();
        while !shutdown.is_cancelled() {
            match self.run_next(shutdown).await? {
                Some(result) => finished.push(result),
                None => break,
            }
        }
        Ok(finished)
    }

    async fn finish_entry(
        &self,
        task_id: &str,
        status: QueueStatus,
        error_code: Option<&str>,
    ) -> Result<()> {
        self.queue
            .update_queue_status(
                task_id,
                status,
                QueueStatusPatch {
                    last_error_code: error_code.map(str::to_string),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

/// Open the task database named by the configuration
pub fn open_repository(config: &Config) -> Result<Repository> {
    let db = match &config.database_path {
        Some(path) => DatabaseConnection::new(path)?,
        None => DatabaseConnection::new_default()?,
    };
    Ok(Repository::new(db))
}

/// Create a task with the configured providers; no toolchain is needed
pub async fn submit_task(
    config: &Config,
    repo: &Repository,
    queue: &TaskQueue,
    source: &str,
    options: SubmitOptions,
) -> Result<TaskRecord> {
    let source = source.trim();
    if source.is_empty() {
        return Err(anyhow!("Source must not be empty"));
    }

    let target_language = options
        .target_language
        .as_deref()
        .unwrap_or(&config.target_language);
    let target_language = language_utils::normalize_language_code(target_language)?;

    let task = TaskRecord::new(
        Uuid::new_v4().to_string(),
        source.to_string(),
        target_language,
        config.translation.provider.to_lowercase_string(),
        config.translation.get_model(),
        config.speech.provider.to_string(),
        options.voice.unwrap_or_else(|| config.speech.voice.clone()),
    );
    repo.create_task(&task).await?;
    info!("Created task {} for {}", task.id, task.source);

    if options.enqueue {
        queue
            .enqueue(&task.id, options.batch_id.as_deref(), options.priority)
            .await?;
    }
    Ok(task)
}
