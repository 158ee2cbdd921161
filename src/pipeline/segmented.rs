/*!
 * The translate and synthesize stages.
 *
 * Both stages work through segments stored per (task, stage). A segment is
 * retried locally while its failure is retryable and attempts remain, and
 * every success appends a checkpoint. Translation runs segments one at a
 * time and stops at the first segment that fails; synthesis spreads them
 * over a small worker pool and only fails once every segment was tried.
 */

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use futures::future::join_all;
use log::{Level, debug, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::database::models::{ArtifactKind, SegmentRecord, SegmentStatus, TaskRecord};
use crate::errors::{PipelineError, ProviderError};
use crate::providers::{SpeechRequest, TranslationRequest};
use crate::recovery::{ConfigSnapshot, RetryPolicy, classify_error};
use crate::segmentation::{assert_segment_integrity, segment};
use crate::workspace::{TaskPaths, concat_manifest};

use super::context::ExecutionContext;
use super::events::PipelineEvent;
use super::scheduler::Scheduler;
use super::Stage;

/// Shared bookkeeping for one pass over a stage's segments
struct SegmentPass<'a> {
    task: &'a TaskRecord,
    paths: &'a TaskPaths,
    stage: Stage,
    policy: RetryPolicy,
    config: ConfigSnapshot,
    total: usize,
    completed: AtomicUsize,
    /// Retries spent so far, kept on failure too
    retries: &'a AtomicU32,
}

impl Scheduler {
    pub(super) async fn translate_stage(
        &self,
        task: &TaskRecord,
        paths: &TaskPaths,
        ctx: &ExecutionContext,
        retries: &AtomicU32,
    ) -> Result<(), PipelineError> {
        let stage = Stage::Translating;
        let transcript_path = self
            .require_artifact(&task.id, ArtifactKind::Transcript)
            .await?;
        let transcript = tokio::fs::read_to_string(&transcript_path).await?;

        let chunks = segment(
            &transcript,
            self.config.segmentation_strategy,
            &self.config.segmentation,
        );
        if chunks.is_empty() {
            return Err(PipelineError::Config(format!(
                "Transcript of task {} contains no text",
                task.id
            )));
        }
        assert_segment_integrity(&transcript, &chunks)?;

        let segments = self
            .prepare_segments(
                &task.id,
                stage,
                chunks.into_iter().map(|c| (c.id, c.text)).collect(),
            )
            .await?;

        let selected = ctx.select_segments(&segments);
        let pass = self.segment_pass(task, paths, stage, &segments, &selected, retries);
        for segment in selected {
            ctx.check_canceled()?;
            self.process_segment(&pass, segment.clone(), ctx).await?;
        }

        let segments = self.ensure_all_succeeded(&task.id, stage).await?;
        let translation = segments
            .iter()
            .filter_map(|s| s.result_text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        tokio::fs::write(&paths.translation, translation).await?;
        self.record_artifact(&task.id, ArtifactKind::Translation, &paths.translation)
            .await?;

        Ok(())
    }

    pub(super) async fn synthesize_stage(
        &self,
        task: &TaskRecord,
        paths: &TaskPaths,
        ctx: &ExecutionContext,
        retries: &AtomicU32,
    ) -> Result<(), PipelineError> {
        let stage = Stage::Synthesizing;
        let translations = self
            .repo
            .list_segments(&task.id, Some(Stage::Translating.as_str()))
            .await?;

        let pieces: Option<Vec<(String, String)>> = translations
            .iter()
            .map(|s| match (&s.status, &s.result_text) {
                (SegmentStatus::Success, Some(text)) => {
                    Some((Uuid::new_v4().to_string(), text.clone()))
                }
                _ => None,
            })
            .collect();
        let pieces = match pieces {
            Some(pieces) if !pieces.is_empty() => pieces,
            _ => {
                return Err(PipelineError::MissingArtifact {
                    task_id: task.id.clone(),
                    kind: "translated segments".to_string(),
                });
            }
        };

        let segments = self.prepare_segments(&task.id, stage, pieces).await?;
        let selected = ctx.select_segments(&segments);
        let pass = self.segment_pass(task, paths, stage, &segments, &selected, retries);

        let workers = self.config.worker_count().min(selected.len().max(1));
        debug!(
            "Synthesizing {} of {} segments with {} workers",
            selected.len(),
            segments.len(),
            workers
        );

        let cursor = AtomicUsize::new(0);
        let first_failure: Mutex<Option<PipelineError>> = Mutex::new(None);

        {
            let (cursor, first_failure, selected, pass) =
                (&cursor, &first_failure, &selected, &pass);
            let pool = (0..workers).map(|_| async move {
                loop {
                    if ctx.cancel.is_cancelled() {
                        break;
                    }
                    // Claiming a slot and advancing the cursor is one atomic step
                    let slot = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(segment) = selected.get(slot) else {
                        break;
                    };

                    match self.process_segment(pass, (*segment).clone(), ctx).await {
                        Ok(()) => {}
                        Err(e) if e.is_canceled() => break,
                        Err(e) => {
                            first_failure.lock().get_or_insert(e);
                        }
                    }
                }
            });
            join_all(pool).await;
        }

        ctx.check_canceled()?;
        if let Some(error) = first_failure.into_inner() {
            return Err(error);
        }

        let segments = self.ensure_all_succeeded(&task.id, stage).await?;
        let files: Vec<PathBuf> = segments
            .iter()
            .filter_map(|s| s.result_text.as_deref().map(PathBuf::from))
            .collect();
        tokio::fs::write(&paths.speech_manifest, concat_manifest(&files)).await?;
        self.record_artifact(&task.id, ArtifactKind::SpeechManifest, &paths.speech_manifest)
            .await?;

        Ok(())
    }

    fn segment_pass<'a>(
        &self,
        task: &'a TaskRecord,
        paths: &'a TaskPaths,
        stage: Stage,
        segments: &[SegmentRecord],
        selected: &[&SegmentRecord],
        retries: &'a AtomicU32,
    ) -> SegmentPass<'a> {
        let done = segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Success)
            .filter(|s| !selected.iter().any(|picked| picked.id == s.id))
            .count();
        SegmentPass {
            task,
            paths,
            stage,
            policy: self.config.retry_policy(stage),
            config: self.config_snapshot(task),
            total: segments.len(),
            completed: AtomicUsize::new(done),
            retries,
        }
    }

    /// Reuse the stored segments when they match `pieces`, otherwise replace them
    async fn prepare_segments(
        &self,
        task_id: &str,
        stage: Stage,
        pieces: Vec<(String, String)>,
    ) -> Result<Vec<SegmentRecord>, PipelineError> {
        let stored = self
            .repo
            .list_segments(task_id, Some(stage.as_str()))
            .await?;

        let unchanged = stored.len() == pieces.len()
            && stored
                .iter()
                .zip(&pieces)
                .all(|(segment, (_, text))| segment.source_text == *text);
        if unchanged {
            debug!("Reusing {} {} segments of {}", stored.len(), stage, task_id);
            return Ok(stored);
        }

        let records: Vec<SegmentRecord> = pieces
            .into_iter()
            .enumerate()
            .map(|(index, (id, text))| {
                SegmentRecord::new(
                    id,
                    task_id.to_string(),
                    stage.as_str().to_string(),
                    index as i64,
                    text,
                )
            })
            .collect();
        self.repo
            .replace_segments(task_id, stage.as_str(), records.clone())
            .await?;
        Ok(records)
    }

    /// Reload a stage's segments and fail on any that did not succeed
    async fn ensure_all_succeeded(
        &self,
        task_id: &str,
        stage: Stage,
    ) -> Result<Vec<SegmentRecord>, PipelineError> {
        let segments = self
            .repo
            .list_segments(task_id, Some(stage.as_str()))
            .await?;

        if let Some(unfinished) = segments.iter().find(|s| s.status != SegmentStatus::Success) {
            let (_, stage_code) = segment_codes(stage)?;
            return Err(PipelineError::SegmentFailed {
                code: stage_code.to_string(),
                segment_id: unfinished.id.clone(),
                message: unfinished
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("Segment {} is {}", unfinished.idx, unfinished.status)),
            });
        }
        Ok(segments)
    }

    /// One provider call for a segment
    async fn attempt(
        &self,
        pass: &SegmentPass<'_>,
        segment: &SegmentRecord,
    ) -> Result<String, ProviderError> {
        match pass.stage {
            Stage::Synthesizing => {
                let request = SpeechRequest {
                    text: segment.source_text.clone(),
                    voice: pass.task.speech_voice.clone(),
                    model: self.speech_model.clone(),
                    output: pass.paths.speech_segment(segment.idx),
                };
                let path = self.synthesizer.synthesize(&request).await?;
                Ok(path.to_string_lossy().into_owned())
            }
            _ => {
                let request = TranslationRequest {
                    text: segment.source_text.clone(),
                    target_language: pass.task.target_language.clone(),
                    model: pass.task.translate_model.clone(),
                };
                self.translator.translate(&request).await
            }
        }
    }

    /// Run one segment to success or final failure
    async fn process_segment(
        &self,
        pass: &SegmentPass<'_>,
        mut segment: SegmentRecord,
        ctx: &ExecutionContext,
    ) -> Result<(), PipelineError> {
        let (segment_code, stage_code) = segment_codes(pass.stage)?;
        let task_id = pass.task.id.as_str();
        let mut attempt: u32 = 0;

        loop {
            ctx.check_canceled()?;
            attempt += 1;

            segment.status = SegmentStatus::Running;
            segment.error_code = None;
            segment.error_message = None;
            self.repo.update_segment(&segment).await?;

            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => None,
                result = self.attempt(pass, &segment) => Some(result),
            };
            let Some(result) = result else {
                self.park_segment(&mut segment).await;
                return Err(PipelineError::Canceled);
            };

            let error = match result {
                Ok(result_text) => {
                    segment.status = SegmentStatus::Success;
                    segment.result_text = Some(result_text);
                    segment.retry_count = i64::from(attempt - 1);
                    self.repo.update_segment(&segment).await?;
                    self.recovery
                        .save_segment_checkpoint(task_id, pass.stage, Some(&segment.id), &pass.config)
                        .await?;

                    let completed = pass.completed.fetch_add(1, Ordering::SeqCst) + 1;
                    self.events.emit(PipelineEvent::SegmentProgress {
                        task_id: task_id.to_string(),
                        stage: pass.stage,
                        segment_id: segment.id.clone(),
                        index: segment.idx,
                        completed,
                        total: pass.total,
                    });
                    self.emit_progress(
                        task_id,
                        pass.stage,
                        completed as f64 / pass.total.max(1) as f64,
                        format!("{} {}/{}", pass.stage, completed, pass.total),
                    );
                    return Ok(());
                }
                Err(error) => error,
            };

            let code = error.code();
            let message = error.to_string();
            let class = classify_error(Some(code), &message);

            if pass.policy.should_retry(attempt, class) {
                let delay = pass.policy.backoff(attempt);
                segment.retry_count = i64::from(attempt);
                pass.retries.fetch_add(1, Ordering::SeqCst);
                self.events.log(
                    task_id,
                    Level::Warn,
                    format!(
                        "Segment {} of {} failed ({}), attempt {}/{}; retrying in {}ms",
                        segment.idx,
                        pass.stage,
                        code,
                        attempt,
                        pass.policy.max_attempts,
                        delay.as_millis()
                    ),
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        self.park_segment(&mut segment).await;
                        return Err(PipelineError::Canceled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            segment.status = SegmentStatus::Failed;
            segment.retry_count = i64::from(attempt - 1);
            segment.error_code = Some(segment_code.to_string());
            segment.error_message = Some(format!("{}: {}", code, message));
            self.repo.update_segment(&segment).await?;

            self.events.log(
                task_id,
                Level::Error,
                format!(
                    "Segment {} of {} failed after {} attempt(s): {}",
                    segment.idx, pass.stage, attempt, message
                ),
            );
            self.events.emit(PipelineEvent::SegmentFailed {
                task_id: task_id.to_string(),
                stage: pass.stage,
                segment_id: segment.id.clone(),
                error_code: segment_code.to_string(),
                error_message: message.clone(),
                attempts: attempt,
            });

            return Err(PipelineError::SegmentFailed {
                code: stage_code.to_string(),
                segment_id: segment.id,
                message,
            });
        }
    }

    /// Put an interrupted segment back to pending
    async fn park_segment(&self, segment: &mut SegmentRecord) {
        segment.status = SegmentStatus::Pending;
        if let Err(e) = self.repo.update_segment(segment).await {
            warn!("Failed to reset segment {}: {}", segment.id, e);
        }
    }
}

fn segment_codes(stage: Stage) -> Result<(&'static str, &'static str), PipelineError> {
    stage
        .segment_codes()
        .ok_or_else(|| PipelineError::Config(format!("{} is not a segmented stage", stage)))
}
