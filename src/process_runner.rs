/*!
 * External command execution.
 *
 * Commands run as child processes with piped output. Every non-empty line
 * on stdout or stderr is trimmed and handed to an optional callback as it
 * arrives. A run ends early when its cancellation token trips or its
 * timeout elapses; in both cases the child is killed.
 */

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::ProcessError;

/// Number of trailing lines kept for error reports
const DEFAULT_TAIL_LINES: usize = 20;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives each output line as it is read
pub type LineCallback = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// A command to run
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a path argument
    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn display_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }
}

/// Output of a successful run
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Every non-empty stdout line
    pub stdout: Vec<String>,
    /// The last stderr lines
    pub stderr_tail: Vec<String>,
}

/// Runs external commands with cancellation and timeouts
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    tail_lines: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    /// Keep `tail_lines` trailing lines in error reports
    pub fn with_tail_lines(tail_lines: usize) -> Self {
        Self {
            tail_lines: tail_lines.max(1),
        }
    }

    /// Run a command to completion
    pub async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        on_line: Option<LineCallback>,
    ) -> Result<CommandOutput, ProcessError> {
        let program = spec.display_name();
        if cancel.is_cancelled() {
            return Err(ProcessError::Canceled { program });
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        debug!("Running {} {}", spec.program.display(), spec.args.join(" "));
        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdout_reader = child.stdout.take().map(|pipe| {
            Self::spawn_reader(pipe, OutputStream::Stdout, on_line.clone(), None)
        });
        let stderr_reader = child.stderr.take().map(|pipe| {
            Self::spawn_reader(pipe, OutputStream::Stderr, on_line.clone(), Some(self.tail_lines))
        });

        let deadline = async {
            match spec.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| ProcessError::Io {
                program: program.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                Self::terminate(&mut child, &program).await;
                return Err(ProcessError::Canceled { program });
            }
            _ = deadline => {
                Self::terminate(&mut child, &program).await;
                return Err(ProcessError::Timeout {
                    program,
                    seconds: spec.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                });
            }
        };

        let stdout = Self::collect(stdout_reader).await;
        let stderr_tail = Self::collect(stderr_reader).await;

        if status.success() {
            Ok(CommandOutput { stdout, stderr_tail })
        } else {
            let skip = stdout.len().saturating_sub(self.tail_lines);
            Err(ProcessError::Exited {
                program,
                code: status.code(),
                stdout_tail: stdout[skip..].to_vec(),
                stderr_tail,
            })
        }
    }

    /// Read lines from a pipe until EOF, keeping all of them or only a tail
    fn spawn_reader<R>(
        pipe: R,
        stream: OutputStream,
        on_line: Option<LineCallback>,
        keep: Option<usize>,
    ) -> JoinHandle<Vec<String>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::new();
            let mut kept = VecDeque::new();

            // Lines are decoded lossily so stray bytes never stop the drain
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Stopped reading {:?}: {}", stream, e);
                        break;
                    }
                }

                let decoded = String::from_utf8_lossy(&buf);
                let line = decoded.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(callback) = &on_line {
                    callback(stream, line);
                }
                kept.push_back(line.to_string());
                if let Some(limit) = keep {
                    while kept.len() > limit {
                        kept.pop_front();
                    }
                }
            }

            kept.into_iter().collect()
        })
    }

    async fn collect(reader: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
        match reader {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn terminate(child: &mut Child, program: &str) {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill {}: {}", program, e);
        }
    }
}
