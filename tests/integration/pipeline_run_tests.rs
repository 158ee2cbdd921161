/*!
 * End-to-end runs of the stage scheduler
 */

use anyhow::Result;

use dubpipe::database::models::{ArtifactKind, SegmentStatus, StageRunStatus, TaskStatus};
use dubpipe::pipeline::{PipelineEvent, RunOutcome, Stage};
use dubpipe::providers::mock::{MockBehavior, MockSynthesizer, MockTranslator};
use dubpipe::recovery::RecoveryActionKind;

use crate::common::{
    FIRST_SENTENCE, FakeMediaToolkit, Harness, SECOND_SENTENCE, THIRD_SENTENCE, pipeline_config,
};

async fn run_to_end(harness: &Harness, task_id: &str) -> Result<RunOutcome> {
    let started = harness.scheduler.start(task_id).await?;
    assert!(started.accepted, "start rejected: {:?}", started.reason);
    Ok(started.wait().await.expect("run should finish"))
}

#[tokio::test]
async fn test_start_healthyProviders_shouldCompleteEveryStage() -> Result<()> {
    let mut harness = Harness::new(pipeline_config())?;
    harness.create_task("task-ok").await?;

    let outcome = run_to_end(&harness, "task-ok").await?;
    assert_eq!(outcome, RunOutcome::Completed);

    let task = harness.repo.get_task("task-ok").await?.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.error_code.is_none());
    assert!(task.finished_at.is_some());

    let runs = harness.repo.list_stage_runs("task-ok").await?;
    let stages: Vec<&str> = runs.iter().map(|r| r.stage.as_str()).collect();
    assert_eq!(
        stages,
        Stage::ALL.iter().map(|s| s.as_str()).collect::<Vec<_>>()
    );
    assert!(runs.iter().all(|r| r.status == StageRunStatus::Success));

    let translated = harness
        .repo
        .list_segments("task-ok", Some("translating"))
        .await?;
    let texts: Vec<&str> = translated.iter().map(|s| s.source_text.as_str()).collect();
    assert_eq!(texts, vec![FIRST_SENTENCE, SECOND_SENTENCE, THIRD_SENTENCE]);
    assert_eq!(
        translated[1].result_text.as_deref(),
        Some(format!("[es] {}", SECOND_SENTENCE).as_str())
    );

    let spoken = harness
        .repo
        .list_segments("task-ok", Some("synthesizing"))
        .await?;
    assert_eq!(spoken.len(), 3);
    assert!(spoken.iter().all(|s| s.status == SegmentStatus::Success));
    assert_eq!(spoken[0].source_text, format!("[es] {}", FIRST_SENTENCE));

    let output = harness
        .repo
        .get_artifact("task-ok", ArtifactKind::Output)
        .await?
        .expect("output artifact");
    let merged = std::fs::read_to_string(&output.path)?;
    assert!(merged.starts_with("DUBBED"));
    assert!(merged.contains("seg_0002.mp3"));

    assert_eq!(harness.media.counts(), [1, 1, 1, 1]);
    assert_eq!(harness.translator.calls(), 3);
    assert_eq!(harness.synthesizer.calls(), 3);
    assert!(harness.scheduler.active_task().is_none());

    let events = harness.drain_events();
    assert!(events.iter().any(|e| matches!(e, PipelineEvent::Completed { .. })));
    let last_percent = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .last();
    assert_eq!(last_percent, Some(100.0));
    Ok(())
}

#[tokio::test]
async fn test_start_transientTranslationFailure_shouldRetryLocally() -> Result<()> {
    let harness = Harness::with_providers(
        pipeline_config(),
        MockTranslator::transient(1),
        MockSynthesizer::working(),
    )?;
    harness.create_task("task-transient").await?;

    let outcome = run_to_end(&harness, "task-transient").await?;
    assert_eq!(outcome, RunOutcome::Completed);

    let segments = harness
        .repo
        .list_segments("task-transient", Some("translating"))
        .await?;
    assert_eq!(segments[0].retry_count, 1);
    assert_eq!(segments[1].retry_count, 0);

    let runs = harness.repo.list_stage_runs("task-transient").await?;
    let translate_run = runs.iter().find(|r| r.stage == "translating").unwrap();
    assert_eq!(translate_run.retry_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_start_segmentKeepsFailing_shouldFailTaskAndSuggestRetry() -> Result<()> {
    let mut harness = Harness::with_providers(
        pipeline_config(),
        MockTranslator::fail_matching("budget", true),
        MockSynthesizer::working(),
    )?;
    harness.create_task("task-fail").await?;

    let outcome = run_to_end(&harness, "task-fail").await?;
    match &outcome {
        RunOutcome::Failed { stage, code, .. } => {
            assert_eq!(*stage, Some(Stage::Translating));
            assert_eq!(code, "E_TRANSLATE_SEGMENT_FAILED");
        }
        other => panic!("expected failure, got {:?}", other),
    }

    let task = harness.repo.get_task("task-fail").await?.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_code.as_deref(), Some("E_TRANSLATE_SEGMENT_FAILED"));

    let segments = harness
        .repo
        .list_segments("task-fail", Some("translating"))
        .await?;
    assert_eq!(segments[0].status, SegmentStatus::Success);
    assert_eq!(segments[1].status, SegmentStatus::Failed);
    assert_eq!(segments[1].error_code.as_deref(), Some("E_TRANSLATE_SEGMENT"));
    assert_eq!(segments[1].retry_count, 1);
    // Translation stops at the first failed segment
    assert_eq!(segments[2].status, SegmentStatus::Pending);
    assert_eq!(harness.translator.calls(), 3);

    // The failed stage run keeps the retries its segments spent
    let runs = harness.repo.list_stage_runs("task-fail").await?;
    let translate_run = runs.iter().find(|r| r.stage == "translating").unwrap();
    assert_eq!(translate_run.status, StageRunStatus::Failed);
    assert_eq!(translate_run.retry_count, 1);

    let plan = harness.scheduler.get_recovery_plan("task-fail").await?;
    assert_eq!(plan.failed_segment_ids(), Some(&[segments[1].id.clone()][..]));
    assert!(plan.actions.iter().any(|a| matches!(
        a.kind,
        RecoveryActionKind::ResumeFromCheckpoint {
            stage: Stage::Translating,
            ..
        }
    )));

    let events = harness.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::SegmentFailed { attempts: 2, .. }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::RecoverySuggested { .. })));
    Ok(())
}

#[tokio::test]
async fn test_retrySegments_afterTranslationFailure_shouldSkipFinishedWork() -> Result<()> {
    let harness = Harness::with_providers(
        pipeline_config(),
        MockTranslator::fail_matching("budget", false),
        MockSynthesizer::working(),
    )?;
    harness.create_task("task-retry").await?;
    run_to_end(&harness, "task-retry").await?;

    let plan = harness.scheduler.get_recovery_plan("task-retry").await?;
    let failed = plan.failed_segment_ids().unwrap().to_vec();
    assert_eq!(failed.len(), 1);

    harness.translator.set_behavior(MockBehavior::Working);
    let started = harness.scheduler.retry_segments("task-retry", &failed).await?;
    assert!(started.accepted);
    assert_eq!(started.wait().await, Some(RunOutcome::Completed));

    // Atomic stages before translation are not repeated
    assert_eq!(harness.media.counts(), [1, 1, 1, 1]);

    let seen = harness.translator.seen();
    assert_eq!(seen.iter().filter(|t| t.as_str() == FIRST_SENTENCE).count(), 1);
    assert_eq!(seen.iter().filter(|t| t.as_str() == SECOND_SENTENCE).count(), 2);
    assert_eq!(seen.iter().filter(|t| t.as_str() == THIRD_SENTENCE).count(), 1);

    let segments = harness
        .repo
        .list_segments("task-retry", Some("translating"))
        .await?;
    assert!(segments.iter().all(|s| s.status == SegmentStatus::Success));
    assert_eq!(segments[1].id, failed[0]);

    let task = harness.repo.get_task("task-retry").await?.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.error_code.is_none());
    Ok(())
}

#[tokio::test]
async fn test_start_synthesisFailure_shouldTryEverySegmentBeforeFailing() -> Result<()> {
    let harness = Harness::with_providers(
        pipeline_config(),
        MockTranslator::working(),
        MockSynthesizer::fail_matching("budget", false),
    )?;
    harness.create_task("task-tts").await?;

    let outcome = run_to_end(&harness, "task-tts").await?;
    assert!(matches!(
        &outcome,
        RunOutcome::Failed { stage: Some(Stage::Synthesizing), code, .. } if code == "E_TTS_SEGMENT_FAILED"
    ));

    let segments = harness
        .repo
        .list_segments("task-tts", Some("synthesizing"))
        .await?;
    let statuses: Vec<SegmentStatus> = segments.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![SegmentStatus::Success, SegmentStatus::Failed, SegmentStatus::Success]
    );
    assert_eq!(harness.synthesizer.calls(), 3);
    assert_eq!(harness.media.counts(), [1, 1, 1, 0]);
    Ok(())
}

#[tokio::test]
async fn test_resumeFromCheckpoint_afterSynthesisFailure_shouldOnlyRedoFailedSegment() -> Result<()> {
    let harness = Harness::with_providers(
        pipeline_config(),
        MockTranslator::working(),
        MockSynthesizer::fail_matching("budget", false),
    )?;
    harness.create_task("task-resume").await?;
    run_to_end(&harness, "task-resume").await?;
    assert_eq!(harness.synthesizer.calls(), 3);

    harness.synthesizer.set_behavior(MockBehavior::Working);
    let started = harness.scheduler.resume_from_checkpoint("task-resume").await?;
    assert!(started.accepted);
    assert_eq!(started.wait().await, Some(RunOutcome::Completed));

    assert_eq!(harness.synthesizer.calls(), 4);
    assert_eq!(harness.translator.calls(), 3);
    assert_eq!(harness.media.counts(), [1, 1, 1, 1]);

    let runs = harness.repo.list_stage_runs("task-resume").await?;
    let synth_runs: Vec<_> = runs.iter().filter(|r| r.stage == "synthesizing").collect();
    assert_eq!(synth_runs.len(), 2);
    assert_eq!(synth_runs[0].status, StageRunStatus::Failed);
    assert_eq!(synth_runs[1].status, StageRunStatus::Success);
    Ok(())
}

#[tokio::test]
async fn test_resumeFromCheckpoint_withoutCheckpoint_shouldReject() -> Result<()> {
    let harness = Harness::new(pipeline_config())?;
    harness.create_task("task-fresh").await?;

    let started = harness.scheduler.resume_from_checkpoint("task-fresh").await?;
    assert!(!started.accepted);
    assert!(started.reason.unwrap().contains("no checkpoint"));
    Ok(())
}

#[tokio::test]
async fn test_cancel_duringTranslation_shouldStopAndParkSegment() -> Result<()> {
    let mut harness = Harness::with_providers(
        pipeline_config(),
        MockTranslator::slow(10_000),
        MockSynthesizer::working(),
    )?;
    harness.create_task("task-cancel").await?;

    let started = harness.scheduler.start("task-cancel").await?;
    assert!(started.accepted);

    let translating = harness
        .wait_for_event(|e| {
            matches!(
                e,
                PipelineEvent::Status {
                    status: TaskStatus::Translating,
                    ..
                }
            )
        })
        .await;
    assert!(translating.is_some());
    // Let the first provider call begin
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(harness.scheduler.cancel("task-cancel").await?);
    assert_eq!(started.wait().await, Some(RunOutcome::Canceled));

    let task = harness.repo.get_task("task-cancel").await?.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);

    let segments = harness
        .repo
        .list_segments("task-cancel", Some("translating"))
        .await?;
    assert!(segments.iter().all(|s| s.status == SegmentStatus::Pending));
    assert!(harness.scheduler.active_task().is_none());

    let runs = harness.repo.list_stage_runs("task-cancel").await?;
    assert_eq!(runs.last().unwrap().status, StageRunStatus::Skipped);
    Ok(())
}

#[tokio::test]
async fn test_start_whileAnotherTaskRuns_shouldReject() -> Result<()> {
    let harness = Harness::with_providers(
        pipeline_config(),
        MockTranslator::slow(10_000),
        MockSynthesizer::working(),
    )?;
    harness.create_task("task-a").await?;
    harness.create_task("task-b").await?;

    let first = harness.scheduler.start("task-a").await?;
    assert!(first.accepted);

    let second = harness.scheduler.start("task-b").await?;
    assert!(!second.accepted);
    assert!(second.reason.unwrap().contains("task-a"));

    let again = harness.scheduler.start("task-a").await?;
    assert!(!again.accepted);

    harness.scheduler.cancel("task-a").await?;
    assert_eq!(first.wait().await, Some(RunOutcome::Canceled));

    let idle = harness.repo.get_task("task-b").await?.unwrap();
    assert_eq!(idle.status, TaskStatus::Idle);
    Ok(())
}

#[tokio::test]
async fn test_start_unknownTask_shouldError() -> Result<()> {
    let harness = Harness::new(pipeline_config())?;
    assert!(harness.scheduler.start("missing").await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_start_emptyTranscript_shouldFailTranslation() -> Result<()> {
    let harness = Harness::with_media(
        pipeline_config(),
        FakeMediaToolkit::new("   "),
        MockTranslator::working(),
        MockSynthesizer::working(),
    )?;
    harness.create_task("task-empty").await?;

    let outcome = run_to_end(&harness, "task-empty").await?;
    assert!(matches!(
        outcome,
        RunOutcome::Failed { stage: Some(Stage::Translating), code, .. } if code == "E_TRANSLATE_FAILED"
    ));
    assert_eq!(harness.translator.calls(), 0);
    Ok(())
}
