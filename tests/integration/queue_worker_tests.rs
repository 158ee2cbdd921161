/*!
 * Tests for the queue worker in the application controller
 */

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use dubpipe::app_controller::{SubmitOptions, WORKER_LOST_CODE};
use dubpipe::database::QueueStatusPatch;
use dubpipe::database::models::{QueueStatus, TaskStatus};
use dubpipe::pipeline::RunOutcome;
use dubpipe::providers::mock::{MockSynthesizer, MockTranslator};

use crate::common;

fn queued(priority: i64) -> SubmitOptions {
    SubmitOptions {
        target_language: Some("es".to_string()),
        priority,
        enqueue: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_submit_shouldNormalizeLanguageAndEnqueue() -> Result<()> {
    let (controller, _media, _dir) =
        common::controller(MockTranslator::working(), MockSynthesizer::working())?;

    let options = SubmitOptions {
        target_language: Some("SPA".to_string()),
        batch_id: Some("batch-1".to_string()),
        enqueue: true,
        ..Default::default()
    };
    let task = controller.submit("  https://example.com/a.mp4 ", options).await?;
    assert_eq!(task.target_language, "es");
    assert_eq!(task.source, "https://example.com/a.mp4");
    assert_eq!(task.status, TaskStatus::Idle);

    let entry = controller.queue().get_entry(&task.id).await?.unwrap();
    assert_eq!(entry.status, QueueStatus::Waiting);
    assert_eq!(entry.queue_index, Some(0));
    assert_eq!(entry.batch_id.as_deref(), Some("batch-1"));
    Ok(())
}

#[tokio::test]
async fn test_submit_withoutEnqueue_shouldOnlyCreateTask() -> Result<()> {
    let (controller, _media, _dir) =
        common::controller(MockTranslator::working(), MockSynthesizer::working())?;

    let task = controller
        .submit("a.mp4", SubmitOptions::default())
        .await?;
    assert!(controller.queue().get_entry(&task.id).await?.is_none());
    assert!(controller.submit("   ", SubmitOptions::default()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_runNext_shouldCompleteTaskAndEntry() -> Result<()> {
    let (controller, media, _dir) =
        common::controller(MockTranslator::working(), MockSynthesizer::working())?;
    let task = controller.submit("a.mp4", queued(0)).await?;
    let shutdown = CancellationToken::new();

    let (task_id, outcome) = controller.run_next(&shutdown).await?.unwrap();
    assert_eq!(task_id, task.id);
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(media.counts(), [1, 1, 1, 1]);

    let entry = controller.queue().get_entry(&task.id).await?.unwrap();
    assert_eq!(entry.status, QueueStatus::Completed);
    assert!(entry.finished_at.is_some());
    assert_eq!(entry.worker_slot, Some(0));

    assert!(controller.run_next(&shutdown).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_runNext_failingTask_shouldRecordErrorCodeOnEntry() -> Result<()> {
    let (controller, _media, _dir) = common::controller(
        MockTranslator::fail_matching("budget", false),
        MockSynthesizer::working(),
    )?;
    let task = controller.submit("a.mp4", queued(0)).await?;

    let (_, outcome) = controller
        .run_next(&CancellationToken::new())
        .await?
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Failed { .. }));

    let entry = controller.queue().get_entry(&task.id).await?.unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(
        entry.last_error_code.as_deref(),
        Some("E_TRANSLATE_SEGMENT_FAILED")
    );
    Ok(())
}

#[tokio::test]
async fn test_drain_shouldRunByPriorityThenFifo() -> Result<()> {
    let (controller, _media, _dir) =
        common::controller(MockTranslator::working(), MockSynthesizer::working())?;
    let low = controller.submit("low.mp4", queued(0)).await?;
    let high = controller.submit("high.mp4", queued(5)).await?;
    let later = controller.submit("later.mp4", queued(0)).await?;

    let finished = controller.drain(&CancellationToken::new()).await?;
    let order: Vec<&str> = finished.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(order, vec![high.id.as_str(), low.id.as_str(), later.id.as_str()]);
    assert!(finished
        .iter()
        .all(|(_, outcome)| *outcome == RunOutcome::Completed));

    let snapshot = controller.queue().get_snapshot().await?;
    assert!(snapshot.waiting.is_empty());
    assert_eq!(snapshot.completed.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_drain_shutdownTripped_shouldNotStartWork() -> Result<()> {
    let (controller, media, _dir) =
        common::controller(MockTranslator::working(), MockSynthesizer::working())?;
    controller.submit("a.mp4", queued(0)).await?;

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let finished = controller.drain(&shutdown).await?;
    assert!(finished.is_empty());
    assert_eq!(media.counts(), [0, 0, 0, 0]);
    Ok(())
}

#[tokio::test]
async fn test_runNext_shutdownDuringRun_shouldCancelTask() -> Result<()> {
    let (controller, _media, _dir) =
        common::controller(MockTranslator::slow(10_000), MockSynthesizer::working())?;
    let task = controller.submit("a.mp4", queued(0)).await?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let (_, outcome) = controller.run_next(&shutdown).await?.unwrap();
    assert_eq!(outcome, RunOutcome::Canceled);

    let stored = controller.repository().get_task(&task.id).await?.unwrap();
    assert_eq!(stored.status, TaskStatus::Canceled);
    let entry = controller.queue().get_entry(&task.id).await?.unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.last_error_code.as_deref(), Some("E_CANCELED"));
    Ok(())
}

#[tokio::test]
async fn test_reclaimStale_shouldRequeueAndFailInterruptedTask() -> Result<()> {
    let mut pipeline = common::pipeline_config();
    pipeline.stale_timeout_secs = 0;
    let (controller, _media, _dir) = common::controller_with(
        pipeline,
        MockTranslator::working(),
        MockSynthesizer::working(),
    )?;
    let task = controller.submit("a.mp4", queued(0)).await?;

    // A worker that died mid-translation
    controller
        .queue()
        .update_queue_status(
            &task.id,
            QueueStatus::Running,
            QueueStatusPatch {
                worker_slot: Some(0),
                ..Default::default()
            },
        )
        .await?;
    controller
        .repository()
        .update_task_status(&task.id, TaskStatus::Translating, None)
        .await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let reclaimed = controller.reclaim_stale().await?;
    assert_eq!(reclaimed, vec![task.id.clone()]);

    let entry = controller.queue().get_entry(&task.id).await?.unwrap();
    assert_eq!(entry.status, QueueStatus::Waiting);
    assert!(entry.worker_slot.is_none());

    let stored = controller.repository().get_task(&task.id).await?.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.error_code.as_deref(), Some(WORKER_LOST_CODE));
    Ok(())
}

#[tokio::test]
async fn test_reclaimStale_freshRunningEntry_shouldStayRunning() -> Result<()> {
    let (controller, _media, _dir) =
        common::controller(MockTranslator::working(), MockSynthesizer::working())?;
    let task = controller.submit("a.mp4", queued(0)).await?;
    controller
        .queue()
        .update_queue_status(&task.id, QueueStatus::Running, QueueStatusPatch::default())
        .await?;

    assert!(controller.reclaim_stale().await?.is_empty());
    let entry = controller.queue().get_entry(&task.id).await?.unwrap();
    assert_eq!(entry.status, QueueStatus::Running);
    Ok(())
}
