/*!
 * Common test utilities for the dubpipe test suite
 */

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use dubpipe::app_config::{Config, PipelineConfig};
use dubpipe::app_controller::Controller;
use dubpipe::database::Repository;
use dubpipe::database::models::TaskRecord;
use dubpipe::errors::PipelineError;
use dubpipe::pipeline::{EventSink, MediaToolkit, PipelineEvent, Scheduler};
use dubpipe::providers::mock::{MockSynthesizer, MockTranslator};
use dubpipe::segmentation::{SegmentationOptions, SegmentationStrategy};
use dubpipe::workspace::Workspace;

/// Three sentences that segment into three chunks with the test settings
pub const TRANSCRIPT: &str = "The first sentence talks about the weather today. \
The second sentence mentions the budget plan. \
The third sentence closes the whole talk.";

pub const FIRST_SENTENCE: &str = "The first sentence talks about the weather today.";
pub const SECOND_SENTENCE: &str = "The second sentence mentions the budget plan.";
pub const THIRD_SENTENCE: &str = "The third sentence closes the whole talk.";

/// Route library logs to the test output
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Pipeline settings with one chunk per sentence and near-instant retries
pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        segmentation_strategy: SegmentationStrategy::Sentence,
        segmentation: SegmentationOptions {
            target_segment_length: Some(60),
            ..Default::default()
        },
        translate_max_attempts: 2,
        synthesize_max_attempts: 2,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        synthesis_workers: 2,
        ..Default::default()
    }
}

/// Media toolkit that writes placeholder files and counts its calls
#[derive(Debug, Default)]
pub struct FakeMediaToolkit {
    pub transcript: String,
    pub downloads: AtomicUsize,
    pub extractions: AtomicUsize,
    pub transcriptions: AtomicUsize,
    pub merges: AtomicUsize,
}

impl FakeMediaToolkit {
    pub fn new(transcript: &str) -> Self {
        Self {
            transcript: transcript.to_string(),
            ..Default::default()
        }
    }

    /// Calls per operation: download, extract, transcribe, merge
    pub fn counts(&self) -> [usize; 4] {
        [
            self.downloads.load(Ordering::SeqCst),
            self.extractions.load(Ordering::SeqCst),
            self.transcriptions.load(Ordering::SeqCst),
            self.merges.load(Ordering::SeqCst),
        ]
    }
}

#[async_trait]
impl MediaToolkit for FakeMediaToolkit {
    async fn download(
        &self,
        source: &str,
        dest: &Path,
        _cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(dest, format!("VIDEO:{}", source)).await?;
        Ok(dest.to_path_buf())
    }

    async fn extract_audio(
        &self,
        _media: &Path,
        dest: &Path,
        _cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(dest, "PCM").await?;
        Ok(dest.to_path_buf())
    }

    async fn transcribe(
        &self,
        _audio: &Path,
        _work_dir: &Path,
        _cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        self.transcriptions.fetch_add(1, Ordering::SeqCst);
        Ok(self.transcript.clone())
    }

    async fn merge(
        &self,
        _media: &Path,
        manifest: &Path,
        dest: &Path,
        _cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        let manifest = tokio::fs::read_to_string(manifest).await?;
        tokio::fs::write(dest, format!("DUBBED\n{}", manifest)).await?;
        Ok(dest.to_path_buf())
    }
}

/// A scheduler over an in-memory database, fake media and mock providers
pub struct Harness {
    pub scheduler: Scheduler,
    pub repo: Repository,
    pub media: Arc<FakeMediaToolkit>,
    pub translator: MockTranslator,
    pub synthesizer: MockSynthesizer,
    pub events: UnboundedReceiver<PipelineEvent>,
    pub workspace: TempDir,
}

impl Harness {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_providers(config, MockTranslator::working(), MockSynthesizer::working())
    }

    pub fn with_providers(
        config: PipelineConfig,
        translator: MockTranslator,
        synthesizer: MockSynthesizer,
    ) -> Result<Self> {
        Self::with_media(config, FakeMediaToolkit::new(TRANSCRIPT), translator, synthesizer)
    }

    pub fn with_media(
        config: PipelineConfig,
        media: FakeMediaToolkit,
        translator: MockTranslator,
        synthesizer: MockSynthesizer,
    ) -> Result<Self> {
        init_logging();
        let repo = Repository::new_in_memory()?;
        let media = Arc::new(media);
        let workspace = TempDir::new()?;
        let (sink, events) = EventSink::channel();

        let scheduler = Scheduler::new(
            repo.clone(),
            media.clone(),
            Arc::new(translator.clone()),
            Arc::new(synthesizer.clone()),
            config,
            "tts-1",
            Workspace::new(workspace.path()),
            sink,
        );

        Ok(Self {
            scheduler,
            repo,
            media,
            translator,
            synthesizer,
            events,
            workspace,
        })
    }

    /// Store a fresh idle task targeting Spanish
    pub async fn create_task(&self, id: &str) -> Result<TaskRecord> {
        let task = sample_task(id);
        self.repo.create_task(&task).await?;
        Ok(task)
    }

    /// Everything emitted so far
    pub fn drain_events(&mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait until an event matching `predicate` arrives
    pub async fn wait_for_event<F>(&mut self, predicate: F) -> Option<PipelineEvent>
    where
        F: Fn(&PipelineEvent) -> bool,
    {
        let waiting = async {
            while let Some(event) = self.events.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        };
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .ok()
            .flatten()
    }
}

pub fn sample_task(id: &str) -> TaskRecord {
    TaskRecord::new(
        id.to_string(),
        "https://example.com/talk.mp4".to_string(),
        "es".to_string(),
        "mock".to_string(),
        "mock-model".to_string(),
        "mock".to_string(),
        "alloy".to_string(),
    )
}

/// A controller over an in-memory database and the given providers
pub fn controller(
    translator: MockTranslator,
    synthesizer: MockSynthesizer,
) -> Result<(Controller, Arc<FakeMediaToolkit>, TempDir)> {
    controller_with(pipeline_config(), translator, synthesizer)
}

pub fn controller_with(
    pipeline: PipelineConfig,
    translator: MockTranslator,
    synthesizer: MockSynthesizer,
) -> Result<(Controller, Arc<FakeMediaToolkit>, TempDir)> {
    init_logging();
    let mut config = Config::default();
    config.pipeline = pipeline;

    let media = Arc::new(FakeMediaToolkit::new(TRANSCRIPT));
    let workspace = TempDir::new()?;
    let controller = Controller::with_parts(
        config,
        Repository::new_in_memory()?,
        media.clone(),
        Arc::new(translator),
        Arc::new(synthesizer),
        Workspace::new(workspace.path()),
        EventSink::disabled(),
    );
    Ok((controller, media, workspace))
}
