/*!
 * Tests for pipeline event payloads and the event sink
 */

use log::Level;
use serde_json::json;

use dubpipe::database::models::TaskStatus;
use dubpipe::pipeline::events::overall_percent;
use dubpipe::pipeline::{EventSink, PipelineEvent, Stage};

#[test]
fn test_event_shouldSerializeWithKindTag() {
    let event = PipelineEvent::SegmentFailed {
        task_id: "t1".into(),
        stage: Stage::Synthesizing,
        segment_id: "s1".into(),
        error_code: "E_TTS_SEGMENT".into(),
        error_message: "boom".into(),
        attempts: 3,
    };

    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["kind"], json!("segmentFailed"));
    assert_eq!(value["taskId"], json!("t1"));
    assert_eq!(value["segmentId"], json!("s1"));
    assert_eq!(value["attempts"], json!(3));
}

#[test]
fn test_overallPercent_shouldSpanAllStages() {
    assert_eq!(overall_percent(Stage::Downloading, 0.0), 0.0);
    assert_eq!(overall_percent(Stage::Merging, 1.0), 100.0);
    assert_eq!(overall_percent(Stage::Translating, 0.5), 58.3);
    // Fractions outside 0..1 are clamped
    assert_eq!(overall_percent(Stage::Extracting, 7.0), overall_percent(Stage::Transcribing, 0.0));
}

#[tokio::test]
async fn test_sink_shouldDeliverInOrder() {
    let (sink, mut events) = EventSink::channel();
    sink.emit(PipelineEvent::Status {
        task_id: "t1".into(),
        status: TaskStatus::Queued,
        stage: None,
    });
    sink.log("t1", Level::Warn, "retrying");
    drop(sink);

    let first = events.recv().await.unwrap();
    assert!(matches!(first, PipelineEvent::Status { status: TaskStatus::Queued, .. }));
    match events.recv().await.unwrap() {
        PipelineEvent::Log { level, message, .. } => {
            assert_eq!(level, "warn");
            assert_eq!(message, "retrying");
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(events.recv().await.is_none());
}

#[test]
fn test_disabledSink_shouldDropEvents() {
    let sink = EventSink::disabled();
    sink.emit(PipelineEvent::Completed {
        task_id: "t1".into(),
        output: None,
    });
    assert_eq!(
        PipelineEvent::Completed {
            task_id: "t1".into(),
            output: None
        }
        .task_id(),
        "t1"
    );
}
