/*!
 * Resolution of the external tools a pipeline run needs.
 *
 * The toolchain is built once by the process bootstrap from the config and
 * handed to the media toolkit; nothing in the pipeline looks tools up on
 * its own.
 */

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};

use crate::app_config::{GpuAcceleration, ToolchainConfig};
use crate::errors::ToolchainError;

/// Hardware features the tools can take advantage of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub gpu: bool,
}

impl Capabilities {
    /// Probe the host for an NVIDIA driver
    pub fn detect() -> Self {
        let gpu = Path::new("/dev/nvidia0").exists() || find_on_path("nvidia-smi").is_some();
        Self { gpu }
    }
}

/// Which transcriber build to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriberVariant {
    Cpu,
    Gpu,
}

/// Resolved tool locations and per-tool time budgets
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub downloader: PathBuf,
    pub ffmpeg: PathBuf,
    pub transcriber: PathBuf,
    pub transcriber_model: Option<PathBuf>,
    pub capabilities: Capabilities,
    pub transcriber_variant: TranscriberVariant,
    pub download_timeout: Duration,
    pub extract_timeout: Duration,
    pub transcribe_timeout: Duration,
    pub merge_timeout: Duration,
}

impl Toolchain {
    /// Resolve every tool, failing on the first one that cannot be found
    pub fn resolve(config: &ToolchainConfig) -> Result<Self, ToolchainError> {
        Self::resolve_with(config, Capabilities::detect())
    }

    /// Resolve with explicit capabilities
    pub fn resolve_with(
        config: &ToolchainConfig,
        capabilities: Capabilities,
    ) -> Result<Self, ToolchainError> {
        let downloader = resolve_program("downloader", &config.downloader)?;
        let ffmpeg = resolve_program("ffmpeg", &config.ffmpeg)?;
        let transcriber = resolve_program("transcriber", &config.transcriber)?;

        if let Some(model) = &config.transcriber_model {
            if !model.exists() {
                return Err(ToolchainError::MissingModel(model.clone()));
            }
        }

        let transcriber_variant = select_variant(config.gpu_acceleration, capabilities);
        info!(
            "Toolchain ready: {} / {} / {} ({:?})",
            downloader.display(),
            ffmpeg.display(),
            transcriber.display(),
            transcriber_variant
        );

        Ok(Self {
            downloader,
            ffmpeg,
            transcriber,
            transcriber_model: config.transcriber_model.clone(),
            capabilities,
            transcriber_variant,
            download_timeout: Duration::from_secs(config.download_timeout_secs),
            extract_timeout: Duration::from_secs(config.extract_timeout_secs),
            transcribe_timeout: Duration::from_secs(config.transcribe_timeout_secs),
            merge_timeout: Duration::from_secs(config.merge_timeout_secs),
        })
    }
}

/// Pick the transcriber variant from the setting and the detected hardware
pub fn select_variant(setting: GpuAcceleration, capabilities: Capabilities) -> TranscriberVariant {
    match setting {
        GpuAcceleration::On => TranscriberVariant::Gpu,
        GpuAcceleration::Off => TranscriberVariant::Cpu,
        GpuAcceleration::Auto if capabilities.gpu => TranscriberVariant::Gpu,
        GpuAcceleration::Auto => TranscriberVariant::Cpu,
    }
}

fn resolve_program(tool: &'static str, program: &str) -> Result<PathBuf, ToolchainError> {
    let not_found = || ToolchainError::NotFound {
        tool,
        program: program.to_string(),
    };

    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let found = find_on_path(program).ok_or_else(not_found)?;
    debug!("Resolved {} to {}", tool, found.display());
    Ok(found)
}

/// Search PATH for an executable file
fn find_on_path(program: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}
