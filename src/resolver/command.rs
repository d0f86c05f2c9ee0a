use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use crate::error::ResolutionError;

/// One invocation of a build tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Ceiling for each of stdout and stderr.
    pub max_output: usize,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: &Path) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
            timeout: Duration::from_secs(600),
            max_output: 16 * 1024 * 1024,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn limits(mut self, timeout: Duration, max_output: usize) -> Self {
        self.timeout = timeout;
        self.max_output = max_output;
        self
    }

    /// Command line for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs build-tool subprocesses. Tests substitute a scripted runner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is an `Ok` output; timeouts,
    /// oversized output and spawn failures are errors.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ResolutionError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
///
/// The child is killed when the timeout fires or the future is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ResolutionError> {
        let command = spec.display();
        debug!("Running `{}` in {}", command, spec.cwd.display());

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ResolutionError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = spec.max_output;

        let completed = async {
            let (out, err) = tokio::join!(read_capped(stdout, limit), read_capped(stderr, limit));
            if matches!(out, Ok(None)) || matches!(err, Ok(None)) {
                // Nobody drains the pipes any more.
                let _ = child.start_kill();
            }
            let status = child.wait().await;
            (out, err, status)
        };

        let (out, err, status) = tokio::time::timeout(spec.timeout, completed)
            .await
            .map_err(|_| ResolutionError::Timeout {
                command: command.clone(),
                timeout: spec.timeout,
            })?;

        let io_error = |source| ResolutionError::Output {
            command: command.clone(),
            source,
        };
        let too_large = || ResolutionError::OutputTooLarge {
            command: command.clone(),
            limit,
        };
        let stdout = out.map_err(io_error)?.ok_or_else(too_large)?;
        let stderr = err.map_err(io_error)?.ok_or_else(too_large)?;
        let status = status.map_err(io_error)?;

        Ok(CommandOutput {
            status: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// Read a pipe to the end; `Ok(None)` once it exceeds `limit` bytes.
async fn read_capped<R>(pipe: Option<R>, limit: usize) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Ok(Some(Vec::new()));
    };
    let mut buf = Vec::new();
    pipe.take(limit as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > limit {
        Ok(None)
    } else {
        Ok(Some(buf))
    }
}

/// Surface a non-zero exit as [`ResolutionError::ToolFailed`].
pub fn require_success(spec: &CommandSpec, output: CommandOutput) -> Result<CommandOutput, ResolutionError> {
    if output.status == 0 {
        return Ok(output);
    }
    let tail: String = {
        let lines: Vec<&str> = output.stderr.lines().collect();
        let start = lines.len().saturating_sub(20);
        lines[start..].join("\n")
    };
    Err(ResolutionError::ToolFailed {
        command: spec.display(),
        status: output.status,
        stderr: tail,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replies to commands whose display line contains a key, in order.
    #[derive(Default)]
    pub struct ScriptedRunner {
        replies: Mutex<Vec<(String, VecDeque<Result<CommandOutput, String>>)>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn reply(self, key: &str, stdout: &str) -> Self {
            self.push(key, Ok(CommandOutput {
                status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }))
        }

        pub fn fail(self, key: &str, status: i32) -> Self {
            self.push(key, Ok(CommandOutput {
                status,
                stdout: String::new(),
                stderr: "BUILD FAILED".to_string(),
            }))
        }

        pub fn time_out(self, key: &str) -> Self {
            self.push(key, Err(key.to_string()))
        }

        fn push(self, key: &str, reply: Result<CommandOutput, String>) -> Self {
            {
                let mut replies = self.replies.lock().unwrap();
                match replies.iter_mut().find(|(k, _)| k == key) {
                    Some((_, queue)) => queue.push_back(reply),
                    None => replies.push((key.to_string(), VecDeque::from([reply]))),
                }
            }
            self
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ResolutionError> {
            let line = spec.display();
            self.calls.lock().unwrap().push(line.clone());
            let mut replies = self.replies.lock().unwrap();
            // Longest matching key wins so specific scripts beat generic ones.
            let entry = replies
                .iter_mut()
                .filter(|(k, _)| line.contains(k.as_str()))
                .max_by_key(|(k, _)| k.len());
            let reply = entry.and_then(|(_, queue)| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });
            match reply {
                Some(Ok(output)) => Ok(output),
                Some(Err(_)) => Err(ResolutionError::Timeout {
                    command: line,
                    timeout: spec.timeout,
                }),
                None => Err(ResolutionError::Spawn {
                    command: line,
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not scripted"),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_joins_args() {
        let spec = CommandSpec::new("./gradlew", Path::new("."))
            .args(["projects", "-q"]);
        assert_eq!(spec.display(), "./gradlew projects -q");
    }

    #[test]
    fn test_require_success_keeps_stderr_tail() {
        let spec = CommandSpec::new("mvn", Path::new("."));
        let output = CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        let err = require_success(&spec, output).unwrap_err();
        assert!(matches!(err, ResolutionError::ToolFailed { status: 1, .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let spec = CommandSpec::new("vulnfixr-no-such-tool", Path::new("."));
        let err = TokioCommandRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, ResolutionError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_ceiling() {
        let spec = CommandSpec::new("sh", Path::new("."))
            .args(["-c", "printf 0123456789"])
            .limits(Duration::from_secs(10), 4);
        let err = TokioCommandRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, ResolutionError::OutputTooLarge { limit: 4, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_child() {
        let spec = CommandSpec::new("sleep", Path::new("."))
            .args(["5"])
            .limits(Duration::from_millis(100), 1024);
        let err = TokioCommandRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, ResolutionError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_stdout() {
        let spec = CommandSpec::new("sh", Path::new("."))
            .args(["-c", "echo hello"]);
        let output = TokioCommandRunner.run(&spec).await.unwrap();
        assert_eq!(output.status, 0);
        assert_eq!(output.stdout.trim(), "hello");
    }
}
