/*!
 * The media side of the pipeline: fetching, audio extraction, transcription
 * and the final mux.
 *
 * `MediaToolkit` is the seam the scheduler drives for its four atomic
 * stages. `CommandMediaToolkit` implements it with the resolved toolchain
 * and the process runner.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::PipelineError;
use crate::process_runner::{CommandSpec, LineCallback, OutputStream, ProcessRunner};
use crate::toolchain::{Toolchain, TranscriberVariant};

/// Media operations behind the atomic stages
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Fetch a URL or copy a local file to `dest`
    async fn download(
        &self,
        source: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError>;

    /// Extract a mono speech-ready audio track from `media` into `dest`
    async fn extract_audio(
        &self,
        media: &Path,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError>;

    /// Transcribe `audio` and return the transcript text
    async fn transcribe(
        &self,
        audio: &Path,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError>;

    /// Replace the audio of `media` with the concatenated speech listed in `manifest`
    async fn merge(
        &self,
        media: &Path,
        manifest: &Path,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError>;
}

/// Media toolkit running the external tools
#[derive(Debug, Clone)]
pub struct CommandMediaToolkit {
    toolchain: Toolchain,
    runner: ProcessRunner,
}

impl CommandMediaToolkit {
    pub fn new(toolchain: Toolchain, runner: ProcessRunner) -> Self {
        Self { toolchain, runner }
    }

    fn log_lines() -> LineCallback {
        Arc::new(|stream, line| match stream {
            OutputStream::Stdout => debug!("| {}", line),
            OutputStream::Stderr => debug!("! {}", line),
        })
    }

    async fn run(&self, spec: CommandSpec, cancel: &CancellationToken) -> Result<(), PipelineError> {
        self.runner.run(&spec, cancel, Some(Self::log_lines())).await?;
        Ok(())
    }

    /// Arguments for the configured downloader
    pub fn download_command(&self, url: &Url, dest: &Path) -> CommandSpec {
        CommandSpec::new(&self.toolchain.downloader)
            .args([
                "--no-playlist",
                "--newline",
                "-f",
                "bv*+ba/b",
                "--merge-output-format",
                "mp4",
                "-o",
            ])
            .path_arg(dest)
            .arg(url.as_str())
            .timeout(self.toolchain.download_timeout)
    }

    pub fn extract_command(&self, media: &Path, dest: &Path) -> CommandSpec {
        CommandSpec::new(&self.toolchain.ffmpeg)
            .args(["-y", "-hide_banner", "-i"])
            .path_arg(media)
            .args(["-vn", "-ac", "1", "-ar", "16000", "-c:a", "pcm_s16le"])
            .path_arg(dest)
            .timeout(self.toolchain.extract_timeout)
    }

    /// Transcriber invocation writing `<output_prefix>.txt`
    pub fn transcribe_command(&self, audio: &Path, output_prefix: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.toolchain.transcriber);
        if let Some(model) = &self.toolchain.transcriber_model {
            spec = spec.arg("-m").path_arg(model);
        }
        spec = spec
            .args(["-l", "auto", "-otxt", "-f"])
            .path_arg(audio)
            .arg("-of")
            .path_arg(output_prefix);
        if self.toolchain.transcriber_variant == TranscriberVariant::Cpu {
            spec = spec.arg("-ng");
        }
        spec.timeout(self.toolchain.transcribe_timeout)
    }

    pub fn merge_command(&self, media: &Path, manifest: &Path, dest: &Path) -> CommandSpec {
        CommandSpec::new(&self.toolchain.ffmpeg)
            .args(["-y", "-hide_banner", "-i"])
            .path_arg(media)
            .args(["-f", "concat", "-safe", "0", "-i"])
            .path_arg(manifest)
            .args([
                "-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy", "-c:a", "aac", "-shortest",
            ])
            .path_arg(dest)
            .timeout(self.toolchain.merge_timeout)
    }
}

/// Whether a source locator names a remote resource
pub fn remote_source(source: &str) -> Option<Url> {
    Url::parse(source)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

#[async_trait]
impl MediaToolkit for CommandMediaToolkit {
    async fn download(
        &self,
        source: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        match remote_source(source) {
            Some(url) => {
                info!("Downloading {}", url);
                self.run(self.download_command(&url, dest), cancel).await?;
            }
            None => {
                let local = Path::new(source);
                if !local.is_file() {
                    return Err(PipelineError::Config(format!(
                        "Source is neither an http(s) URL nor a file: {}",
                        source
                    )));
                }
                info!("Copying local source {}", local.display());
                tokio::fs::copy(local, dest).await?;
            }
        }
        Ok(dest.to_path_buf())
    }

    async fn extract_audio(
        &self,
        media: &Path,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        self.run(self.extract_command(media, dest), cancel).await?;
        Ok(dest.to_path_buf())
    }

    async fn transcribe(
        &self,
        audio: &Path,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let prefix = work_dir.join("transcriber");
        self.run(self.transcribe_command(audio, &prefix), cancel).await?;

        let text = tokio::fs::read_to_string(prefix.with_extension("txt")).await?;
        Ok(text.trim().to_string())
    }

    async fn merge(
        &self,
        media: &Path,
        manifest: &Path,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        self.run(self.merge_command(media, manifest, dest), cancel).await?;
        Ok(dest.to_path_buf())
    }
}
