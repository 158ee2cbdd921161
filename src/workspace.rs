use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

// @module: Per-task working directories

/// Root directory name under the user data dir
const DEFAULT_WORKSPACE_DIRNAME: &str = "dubpipe/tasks";

// @struct: Root under which every task gets its own directory
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    // @returns: Workspace under the user's local data directory
    pub fn new_default() -> Result<Self> {
        let base_dir = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .context("Could not determine data directory")?;
        Ok(Self::new(base_dir.join(DEFAULT_WORKSPACE_DIRNAME)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // @returns: Directory of a task (not created)
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    // @creates: Task directory and its speech subdirectory
    pub fn ensure_task_dir(&self, task_id: &str) -> Result<TaskPaths> {
        let paths = TaskPaths::new(self.task_dir(task_id));
        ensure_dir(&paths.speech_dir)?;
        Ok(paths)
    }
}

// @struct: Fixed file layout inside a task directory
#[derive(Debug, Clone)]
pub struct TaskPaths {
    pub dir: PathBuf,
    pub source_media: PathBuf,
    pub audio: PathBuf,
    pub transcript: PathBuf,
    pub translation: PathBuf,
    pub speech_dir: PathBuf,
    pub speech_manifest: PathBuf,
    pub output: PathBuf,
}

impl TaskPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            source_media: dir.join("source.mp4"),
            audio: dir.join("audio.wav"),
            transcript: dir.join("transcript.txt"),
            translation: dir.join("translation.txt"),
            speech_dir: dir.join("speech"),
            speech_manifest: dir.join("speech_concat.txt"),
            output: dir.join("output.mp4"),
            dir,
        }
    }

    // @returns: Audio file for the synthesized segment at `index`
    pub fn speech_segment(&self, index: i64) -> PathBuf {
        self.speech_dir.join(format!("seg_{:04}.mp3", index))
    }
}

// @creates: Directory and parents if needed
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    }
    Ok(())
}

// @writes: Content to a file, creating parent directories
pub fn write_to_file<P: AsRef<Path>>(path: P, content: &str) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write file: {}", path.display()))
}

// @reads: File to string
pub fn read_to_string<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).with_context(|| format!("Failed to read file: {}", path.display()))
}

/// Build an ffmpeg concat-demuxer manifest for audio files
pub fn concat_manifest(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|f| format!("file '{}'\n", f.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensureTaskDir_shouldCreateSpeechDir() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(root.path());

        let paths = workspace.ensure_task_dir("task-1").unwrap();

        assert!(paths.speech_dir.is_dir());
        assert_eq!(paths.output, root.path().join("task-1").join("output.mp4"));
        assert!(paths.speech_segment(7).ends_with("speech/seg_0007.mp3"));
    }

    #[test]
    fn test_writeToFile_shouldCreateParents() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("a/b/c.txt");

        write_to_file(&path, "hello").unwrap();
        assert_eq!(read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn test_concatManifest_shouldQuotePaths() {
        let manifest = concat_manifest(&[PathBuf::from("/tmp/it's.mp3"), PathBuf::from("/tmp/b.mp3")]);
        assert_eq!(manifest, "file '/tmp/it'\\''s.mp3'\nfile '/tmp/b.mp3'\n");
    }
}
