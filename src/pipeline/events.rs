/*!
 * Typed events published while a task runs.
 */

use log::Level;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::database::models::TaskStatus;
use crate::recovery::RecoveryPlan;

use super::Stage;

/// Something observable happened to a task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PipelineEvent {
    #[serde(rename_all = "camelCase")]
    Status {
        task_id: String,
        status: TaskStatus,
        stage: Option<Stage>,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        task_id: String,
        stage: Stage,
        /// Overall completion, 0 to 100
        percent: f64,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    SegmentProgress {
        task_id: String,
        stage: Stage,
        segment_id: String,
        index: i64,
        completed: usize,
        total: usize,
    },
    #[serde(rename_all = "camelCase")]
    SegmentFailed {
        task_id: String,
        stage: Stage,
        segment_id: String,
        error_code: String,
        error_message: String,
        attempts: u32,
    },
    #[serde(rename_all = "camelCase")]
    RecoverySuggested { task_id: String, plan: RecoveryPlan },
    #[serde(rename_all = "camelCase")]
    Log {
        task_id: String,
        level: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        task_id: String,
        output: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        task_id: String,
        stage: Option<Stage>,
        error_code: String,
        error_message: String,
    },
}

impl PipelineEvent {
    pub fn task_id(&self) -> &str {
        match self {
            PipelineEvent::Status { task_id, .. }
            | PipelineEvent::Progress { task_id, .. }
            | PipelineEvent::SegmentProgress { task_id, .. }
            | PipelineEvent::SegmentFailed { task_id, .. }
            | PipelineEvent::RecoverySuggested { task_id, .. }
            | PipelineEvent::Log { task_id, .. }
            | PipelineEvent::Completed { task_id, .. }
            | PipelineEvent::Failed { task_id, .. } => task_id,
        }
    }
}

/// Sending half of the event channel; a sink without a receiver drops events
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver that observes it
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            // A closed receiver only means nobody is watching anymore
            let _ = tx.send(event);
        }
    }

    /// Write a log line and publish it as a `Log` event
    pub fn log(&self, task_id: &str, level: Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "[{}] {}", task_id, message);
        self.emit(PipelineEvent::Log {
            task_id: task_id.to_string(),
            level: level.as_str().to_lowercase(),
            message,
        });
    }
}

/// Overall completion percentage for a position inside a stage
pub fn overall_percent(stage: Stage, stage_fraction: f64) -> f64 {
    let fraction = stage_fraction.clamp(0.0, 1.0);
    ((stage.index() as f64 + fraction) / Stage::ALL.len() as f64 * 100.0 * 10.0).round() / 10.0
}
