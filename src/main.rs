// Module-specific lints configuration
#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result, anyhow};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use indicatif::{ProgressBar, ProgressStyle};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError, error, info, warn};
use std::io::Write;
use std::path::Path;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use dubpipe::app_config::{self, Config};
use dubpipe::app_controller::{self, Controller, SubmitOptions};
use dubpipe::database::Repository;
use dubpipe::database::models::TaskStatus;
use dubpipe::pipeline::{EventSink, PipelineEvent, RunOutcome};
use dubpipe::queue::TaskQueue;
use dubpipe::recovery::{ConfigSnapshot, RecoveryActionKind, RecoveryManager, RecoveryPlan};

/// CLI Wrapper for LogLevel to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for app_config::LogLevel {
    fn from(cli_level: CliLogLevel) -> Self {
        match cli_level {
            CliLogLevel::Error => app_config::LogLevel::Error,
            CliLogLevel::Warn => app_config::LogLevel::Warn,
            CliLogLevel::Info => app_config::LogLevel::Info,
            CliLogLevel::Debug => app_config::LogLevel::Debug,
            CliLogLevel::Trace => app_config::LogLevel::Trace,
        }
    }
}

fn level_filter(level: &app_config::LogLevel) -> LevelFilter {
    match level {
        app_config::LogLevel::Error => LevelFilter::Error,
        app_config::LogLevel::Warn => LevelFilter::Warn,
        app_config::LogLevel::Info => LevelFilter::Info,
        app_config::LogLevel::Debug => LevelFilter::Debug,
        app_config::LogLevel::Trace => LevelFilter::Trace,
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a dubbing task and put it in the queue
    Submit {
        /// Video URL or local media file
        #[arg(value_name = "SOURCE")]
        source: String,

        /// Target language code (e.g., 'en', 'es', 'fr')
        #[arg(short, long)]
        target_language: Option<String>,

        /// Voice for speech synthesis
        #[arg(long)]
        voice: Option<String>,

        /// Queue priority; higher runs first
        #[arg(short, long, default_value_t = 0)]
        priority: i64,

        /// Batch the task belongs to
        #[arg(short, long)]
        batch: Option<String>,

        /// Create the task without enqueueing it
        #[arg(long)]
        no_queue: bool,
    },

    /// Work through the queue until it is empty
    Run,

    /// Run one task right away, outside the queue
    Start {
        task_id: String,
    },

    /// Re-run failed segments of a task
    Retry {
        task_id: String,

        /// Segments to re-run; defaults to the ones the recovery plan names
        segment_ids: Vec<String>,
    },

    /// Resume a task from its latest checkpoint
    Resume {
        task_id: String,
    },

    /// List tasks
    Tasks {
        /// Only tasks with this status
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show the queue
    Queue,

    /// Move a waiting task to another queue position
    Reorder {
        task_id: String,
        index: i64,
    },

    /// Take a waiting task out of the queue
    Remove {
        task_id: String,
    },

    /// Put tasks back at the tail of the queue
    Requeue {
        #[arg(required = true)]
        task_ids: Vec<String>,
    },

    /// Show the segments of a task
    Segments {
        task_id: String,
    },

    /// Show recovery suggestions for a failed task
    Plan {
        task_id: String,
    },

    /// Generate shell completions for dubpipe
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// dubpipe - Video dubbing pipeline
///
/// Downloads a video, transcribes its speech, translates the transcript,
/// synthesizes the translation and merges the new audio back in.
#[derive(Parser, Debug)]
#[command(name = "dubpipe")]
#[command(version)]
#[command(about = "Resumable video dubbing pipeline")]
#[command(long_about = "dubpipe turns a video into a dubbed copy in another language.

EXAMPLES:
    dubpipe submit https://example.com/talk -t es   # Queue a Spanish dub
    dubpipe run                                     # Work through the queue
    dubpipe queue                                   # Show waiting and finished tasks
    dubpipe plan <TASK_ID>                          # Show recovery suggestions
    dubpipe retry <TASK_ID>                         # Re-run the failed segments
    dubpipe resume <TASK_ID>                        # Continue from the last checkpoint
    dubpipe completions bash > dubpipe.bash         # Generate bash completions

CONFIGURATION:
    Configuration is stored in conf.json by default. You can specify a different
    config file with --config-path. If the config file doesn't exist, a default one
    will be created automatically.")]
struct CommandLineOptions {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "conf.json")]
    config_path: String,

    /// Set logging level
    #[arg(short, long, global = true, value_enum)]
    log_level: Option<CliLogLevel>,
}

// @struct: Custom logger implementation
struct CustomLogger {
    level: LevelFilter,
}

impl CustomLogger {
    // @initializes: Global logger
    fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(CustomLogger { level: LevelFilter::Trace }))?;
        log::set_max_level(level);
        Ok(())
    }

    // @returns: Emoji and ANSI color for a level
    fn decoration(level: Level) -> (&'static str, &'static str) {
        match level {
            Level::Error => ("❌", "1;31"),
            Level::Warn => ("🚧", "1;33"),
            Level::Info => ("🎬", "1;32"),
            Level::Debug => ("🔍", "1;36"),
            Level::Trace => ("📋", "1;35"),
        }
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now = chrono::Local::now().format("%H:%M:%S.%3f");
            let (emoji, color) = Self::decoration(record.level());
            let _ = writeln!(
                std::io::stderr(),
                "\x1B[{}m{} {} {}\x1B[0m",
                color,
                now,
                emoji,
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    CustomLogger::init(LevelFilter::Info)?;

    let cli = CommandLineOptions::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = CommandLineOptions::command();
        generate(*shell, &mut cmd, "dubpipe", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Submit {
            source,
            target_language,
            voice,
            priority,
            batch,
            no_queue,
        } => {
            let repo = app_controller::open_repository(&config)?;
            let queue = TaskQueue::new(repo.clone());
            let options = SubmitOptions {
                target_language,
                voice,
                priority,
                batch_id: batch,
                enqueue: !no_queue,
            };
            let task = app_controller::submit_task(&config, &repo, &queue, &source, options).await?;
            println!("{}", task.id);
        }
        Commands::Run => run_queue(config).await?,
        Commands::Start { task_id } => run_single(config, &task_id, Launch::Start).await?,
        Commands::Retry {
            task_id,
            segment_ids,
        } => {
            let segment_ids = if segment_ids.is_empty() {
                let plan = recovery_plan(&config, &task_id).await?;
                plan.failed_segment_ids()
                    .map(<[String]>::to_vec)
                    .ok_or_else(|| anyhow!("Task {} has no failed segments to retry", task_id))?
            } else {
                segment_ids
            };
            run_single(config, &task_id, Launch::Retry(segment_ids)).await?
        }
        Commands::Resume { task_id } => run_single(config, &task_id, Launch::Resume).await?,
        Commands::Tasks { status } => {
            let repo = app_controller::open_repository(&config)?;
            let status = status
                .map(|s| s.parse::<TaskStatus>())
                .transpose()
                .map_err(|e| anyhow!("Invalid status: {}", e))?;
            for task in repo.list_tasks(status).await? {
                println!(
                    "{}  {:<12} {:<4} {}{}",
                    task.id,
                    task.status,
                    task.target_language,
                    task.source,
                    task.error_code
                        .map(|code| format!("  [{}]", code))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Queue => {
            let queue = TaskQueue::new(app_controller::open_repository(&config)?);
            let snapshot = queue.get_snapshot().await?;
            if snapshot.is_empty() {
                println!("Queue is empty");
            }
            for (label, entries) in [
                ("Running", &snapshot.running),
                ("Waiting", &snapshot.waiting),
                ("Completed", &snapshot.completed),
                ("Failed", &snapshot.failed),
            ] {
                if entries.is_empty() {
                    continue;
                }
                println!("{}:", label);
                for entry in entries {
                    println!(
                        "  {:>3} {}  priority {}{}{}",
                        entry
                            .queue_index
                            .map(|i| i.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        entry.task_id,
                        entry.priority,
                        entry
                            .batch_id
                            .as_ref()
                            .map(|b| format!("  batch {}", b))
                            .unwrap_or_default(),
                        entry
                            .last_error_code
                            .as_ref()
                            .map(|c| format!("  [{}]", c))
                            .unwrap_or_default()
                    );
                }
            }
        }
        Commands::Reorder { task_id, index } => {
            let queue = TaskQueue::new(app_controller::open_repository(&config)?);
            let waiting = queue.reorder(&task_id, index).await?;
            for entry in waiting {
                println!("{:>3} {}", entry.queue_index.unwrap_or_default(), entry.task_id);
            }
        }
        Commands::Remove { task_id } => {
            let queue = TaskQueue::new(app_controller::open_repository(&config)?);
            queue.remove_waiting_task(&task_id).await?;
            info!("Removed {} from the queue", task_id);
        }
        Commands::Requeue { task_ids } => {
            let queue = TaskQueue::new(app_controller::open_repository(&config)?);
            let requeued = queue.requeue_tasks(&task_ids).await?;
            info!("Requeued {} of {} task(s)", requeued.len(), task_ids.len());
        }
        Commands::Segments { task_id } => {
            let repo = app_controller::open_repository(&config)?;
            for segment in RecoveryManager::new(repo).list_segments(&task_id).await? {
                println!(
                    "{:<13} {:>4} {:<9} retries {}  {}{}",
                    segment.stage,
                    segment.idx,
                    segment.status,
                    segment.retry_count,
                    segment.id,
                    segment
                        .error_code
                        .map(|c| format!("  [{}]", c))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Plan { task_id } => {
            let plan = recovery_plan(&config, &task_id).await?;
            print_plan(&plan);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(cli: &CommandLineOptions) -> Result<Config> {
    if let Some(cmd_log_level) = &cli.log_level {
        log::set_max_level(level_filter(&cmd_log_level.clone().into()));
    }

    let config_path = Path::new(&cli.config_path);
    if !config_path.exists() {
        warn!(
            "Config file not found at '{}', creating default config.",
            config_path.display()
        );
    }
    let mut config = Config::load_or_create(config_path)?;
    if let Some(log_level) = &cli.log_level {
        config.log_level = log_level.clone().into();
    }

    config.validate().context("Configuration validation failed")?;

    if cli.log_level.is_none() {
        log::set_max_level(level_filter(&config.log_level));
    }
    Ok(config)
}

async fn recovery_plan(config: &Config, task_id: &str) -> Result<RecoveryPlan> {
    let repo: Repository = app_controller::open_repository(config)?;
    let task = repo
        .get_task(task_id)
        .await?
        .ok_or_else(|| anyhow!("Task {} not found", task_id))?;
    let snapshot = ConfigSnapshot::for_task(
        &task,
        config.pipeline.segmentation_strategy,
        &config.pipeline.segmentation,
    );
    RecoveryManager::new(repo).create_plan(task_id, &snapshot).await
}

fn print_plan(plan: &RecoveryPlan) {
    if plan.is_empty() {
        println!("No recovery actions for {}", plan.task_id);
        return;
    }
    for action in &plan.actions {
        println!("- {}: {}", action.label, action.reason);
        match &action.kind {
            RecoveryActionKind::RetryFailedSegments { segment_ids } => {
                println!("    dubpipe retry {} {}", plan.task_id, segment_ids.join(" "));
            }
            RecoveryActionKind::ResumeFromCheckpoint { .. } => {
                println!("    dubpipe resume {}", plan.task_id);
            }
        }
    }
}

/// Trip the token on Ctrl+C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; canceling the running task");
            trigger.cancel();
        }
    });
    token
}

fn spawn_progress(mut events: UnboundedReceiver<PipelineEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let progress_bar = ProgressBar::new(100);
        progress_bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░"),
        );

        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::Status { task_id, status, .. } => {
                    if status == TaskStatus::Queued {
                        progress_bar.reset();
                    }
                    progress_bar.set_message(format!("{} {}", short_id(&task_id), status));
                }
                PipelineEvent::Progress { percent, message, .. } => {
                    progress_bar.set_position(percent.round() as u64);
                    progress_bar.set_message(message);
                }
                PipelineEvent::SegmentFailed {
                    segment_id,
                    error_code,
                    error_message,
                    attempts,
                    ..
                } => {
                    progress_bar.suspend(|| {
                        error!(
                            "Segment {} failed after {} attempt(s) [{}]: {}",
                            segment_id, attempts, error_code, error_message
                        )
                    });
                }
                PipelineEvent::RecoverySuggested { plan, .. } => {
                    progress_bar.suspend(|| print_plan(&plan));
                }
                PipelineEvent::Completed { task_id, output } => {
                    progress_bar.set_position(100);
                    progress_bar.suspend(|| {
                        info!(
                            "Task {} completed: {}",
                            short_id(&task_id),
                            output.as_deref().unwrap_or("-")
                        )
                    });
                }
                PipelineEvent::Failed {
                    task_id,
                    error_code,
                    error_message,
                    ..
                } => {
                    progress_bar.suspend(|| {
                        error!(
                            "Task {} failed [{}]: {}",
                            short_id(&task_id),
                            error_code,
                            error_message
                        )
                    });
                }
                PipelineEvent::SegmentProgress { .. } | PipelineEvent::Log { .. } => {}
            }
        }
        progress_bar.finish_and_clear();
    })
}

fn short_id(task_id: &str) -> &str {
    task_id.get(..8).unwrap_or(task_id)
}

async fn run_queue(config: Config) -> Result<()> {
    let (sink, events) = EventSink::channel();
    let controller = Controller::with_config(config, sink)?;
    let progress = spawn_progress(events);
    let shutdown = shutdown_on_ctrl_c();

    let finished = controller.drain(&shutdown).await?;
    let failed = finished
        .iter()
        .filter(|(_, outcome)| !matches!(outcome, RunOutcome::Completed))
        .count();

    drop(controller);
    let _ = progress.await;

    info!(
        "Processed {} task(s), {} did not complete",
        finished.len(),
        failed
    );
    Ok(())
}

/// How a single run outside the queue begins
enum Launch {
    Start,
    Retry(Vec<String>),
    Resume,
}

async fn run_single(config: Config, task_id: &str, launch: Launch) -> Result<()> {
    let (sink, events) = EventSink::channel();
    let controller = Controller::with_config(config, sink)?;
    let progress = spawn_progress(events);
    let shutdown = shutdown_on_ctrl_c();

    let scheduler = controller.scheduler();
    let started = match launch {
        Launch::Start => scheduler.start(task_id).await?,
        Launch::Retry(segment_ids) => scheduler.retry_segments(task_id, &segment_ids).await?,
        Launch::Resume => scheduler.resume_from_checkpoint(task_id).await?,
    };
    if !started.accepted {
        return Err(anyhow!(
            "{}",
            started.reason.unwrap_or_else(|| "Run was not started".to_string())
        ));
    }
    let Some(mut handle) = started.handle else {
        return Err(anyhow!("Run of {} was not started", task_id));
    };

    let outcome = tokio::select! {
        joined = &mut handle => joined?,
        _ = shutdown.cancelled() => {
            controller.scheduler().cancel(task_id).await?;
            handle.await?
        }
    };

    drop(controller);
    let _ = progress.await;

    match outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Canceled => Err(anyhow!("Task {} was canceled", task_id)),
        RunOutcome::Failed { code, message, .. } => {
            Err(anyhow!("Task {} failed [{}]: {}", task_id, code, message))
        }
    }
}
