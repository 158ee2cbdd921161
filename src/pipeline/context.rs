use std::collections::HashSet;

use tokio_util::sync::CancellationToken;

use crate::database::models::{SegmentRecord, SegmentStatus};
use crate::errors::PipelineError;

use super::Stage;

/// Everything one pipeline run needs to know about how it was started
///
/// Built once by `start`, `retry_segments` or `resume_from_checkpoint` and
/// dropped when the run ends.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: String,
    /// First stage to run; the whole sequence when unset
    pub resume_stage: Option<Stage>,
    /// Segments explicitly asked to run again
    pub retry_segment_ids: Option<HashSet<String>>,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            resume_stage: None,
            retry_segment_ids: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn resume_from(mut self, stage: Stage) -> Self {
        self.resume_stage = Some(stage);
        self
    }

    pub fn with_retry_set<I>(mut self, segment_ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.retry_segment_ids = Some(segment_ids.into_iter().collect());
        self
    }

    pub fn first_stage(&self) -> Stage {
        self.resume_stage.unwrap_or(Stage::Downloading)
    }

    pub fn check_canceled(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Pick the segments of one stage that this run must process
    ///
    /// When the retry set names segments of the stage, only those run along
    /// with segments that never finished; everything else keeps its state.
    /// Otherwise every segment that has not succeeded runs.
    pub fn select_segments<'a>(&self, segments: &'a [SegmentRecord]) -> Vec<&'a SegmentRecord> {
        let retry_set = self
            .retry_segment_ids
            .as_ref()
            .filter(|ids| segments.iter().any(|s| ids.contains(&s.id)));

        segments
            .iter()
            .filter(|segment| match retry_set {
                Some(ids) => {
                    ids.contains(&segment.id)
                        || matches!(segment.status, SegmentStatus::Pending | SegmentStatus::Running)
                }
                None => segment.status != SegmentStatus::Success,
            })
            .collect()
    }
}
