//! Handlers of the four atomic stages.
//!
//! Each handler reads the artifacts earlier stages left behind, runs one
//! media operation and records what it produced.

use crate::database::models::{ArtifactKind, TaskRecord};
use crate::errors::PipelineError;
use crate::workspace::TaskPaths;

use super::context::ExecutionContext;
use super::scheduler::Scheduler;

impl Scheduler {
    pub(super) async fn download_stage(
        &self,
        task: &TaskRecord,
        paths: &TaskPaths,
        ctx: &ExecutionContext,
    ) -> Result<(), PipelineError> {
        let media = self
            .media
            .download(&task.source, &paths.source_media, &ctx.cancel)
            .await?;
        self.record_artifact(&task.id, ArtifactKind::SourceMedia, &media)
            .await
    }

    pub(super) async fn extract_stage(
        &self,
        task: &TaskRecord,
        paths: &TaskPaths,
        ctx: &ExecutionContext,
    ) -> Result<(), PipelineError> {
        let media = self
            .require_artifact(&task.id, ArtifactKind::SourceMedia)
            .await?;
        let audio = self
            .media
            .extract_audio(&media, &paths.audio, &ctx.cancel)
            .await?;
        self.record_artifact(&task.id, ArtifactKind::Audio, &audio)
            .await
    }

    pub(super) async fn transcribe_stage(
        &self,
        task: &TaskRecord,
        paths: &TaskPaths,
        ctx: &ExecutionContext,
    ) -> Result<(), PipelineError> {
        let audio = self.require_artifact(&task.id, ArtifactKind::Audio).await?;
        let transcript = self
            .media
            .transcribe(&audio, &paths.dir, &ctx.cancel)
            .await?;
        ctx.check_canceled()?;

        tokio::fs::write(&paths.transcript, &transcript).await?;
        self.record_artifact(&task.id, ArtifactKind::Transcript, &paths.transcript)
            .await
    }

    pub(super) async fn merge_stage(
        &self,
        task: &TaskRecord,
        paths: &TaskPaths,
        ctx: &ExecutionContext,
    ) -> Result<(), PipelineError> {
        let media = self
            .require_artifact(&task.id, ArtifactKind::SourceMedia)
            .await?;
        let manifest = self
            .require_artifact(&task.id, ArtifactKind::SpeechManifest)
            .await?;
        let output = self
            .media
            .merge(&media, &manifest, &paths.output, &ctx.cancel)
            .await?;
        self.record_artifact(&task.id, ArtifactKind::Output, &output)
            .await
    }
}
