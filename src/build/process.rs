//! External CLI invocation (`docker`, `aws`, `minikube`, `kind`, `k3d`).

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::CommandError;

/// A command line to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, then stdin is closed.
    pub stdin: Option<String>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            current_dir: None,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// `program arg1 arg2`, for logs. Never includes stdin.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stderr, or stdout when stderr is empty.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output.
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Run to completion, sending each stdout/stderr line to `lines` as it
    /// arrives. Returns the exit code.
    async fn stream(
        &self,
        spec: &CommandSpec,
        lines: mpsc::Sender<String>,
    ) -> Result<i32, CommandError>;
}

/// `CommandRunner` backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn(spec: &CommandSpec) -> Result<tokio::process::Child, CommandError> {
        Self::command(spec).spawn().map_err(|e| CommandError::Spawn {
            program: spec.program.clone(),
            reason: e.to_string(),
        })
    }

    async fn feed_stdin(
        spec: &CommandSpec,
        child: &mut tokio::process::Child,
    ) -> Result<(), CommandError> {
        let Some(input) = &spec.stdin else {
            return Ok(());
        };
        let Some(mut stdin) = child.stdin.take() else {
            return Ok(());
        };
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| io_err(spec, e))?;
        // Dropping closes the pipe so the child sees EOF.
        drop(stdin);
        Ok(())
    }
}

/// Send each line of `pipe` to `lines`, decoding lossily.
///
/// Reads to EOF even after the receiver is gone so the child never blocks
/// on a full pipe.
async fn forward_lines<R>(pipe: R, lines: mpsc::Sender<String>, program: String)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    let mut receiving = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(program = %program, error = %e, "Failed to read command output");
                break;
            }
        }
        if !receiving {
            continue;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        if lines.send(line.to_string()).await.is_err() {
            tracing::debug!(program = %program, "Output receiver dropped, discarding the rest");
            receiving = false;
        }
    }
}

fn io_err(spec: &CommandSpec, e: std::io::Error) -> CommandError {
    CommandError::Io {
        program: spec.program.clone(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        tracing::debug!(command = %spec.display(), "Running command");
        let mut child = Self::spawn(spec)?;
        Self::feed_stdin(spec, &mut child).await?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| io_err(spec, e))?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn stream(
        &self,
        spec: &CommandSpec,
        lines: mpsc::Sender<String>,
    ) -> Result<i32, CommandError> {
        tracing::debug!(command = %spec.display(), "Streaming command");
        let mut child = Self::spawn(spec)?;
        Self::feed_stdin(spec, &mut child).await?;

        let stdout = child.stdout.take().ok_or_else(|| CommandError::Io {
            program: spec.program.clone(),
            reason: "failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| CommandError::Io {
            program: spec.program.clone(),
            reason: "failed to capture stderr".to_string(),
        })?;

        let stderr_handle = tokio::spawn(forward_lines(stderr, lines.clone(), spec.program.clone()));
        forward_lines(stdout, lines, spec.program.clone()).await;

        let status = child.wait().await.map_err(|e| io_err(spec, e))?;
        let _ = stderr_handle.await;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("docker", ["build", "-t", "img:latest", "."])
            .with_stdin("secret");
        assert_eq!(spec.display(), "docker build -t img:latest .");
    }

    #[test]
    fn error_text_prefers_stderr() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "out".into(),
            stderr: "  denied \n".into(),
        };
        assert_eq!(out.error_text(), "denied");
        let out = CommandOutput {
            exit_code: 1,
            stdout: "only out\n".into(),
            stderr: String::new(),
        };
        assert_eq!(out.error_text(), "only out");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_and_stdin() {
        let runner = ProcessRunner::new();
        let out = runner
            .output(&CommandSpec::new("cat", Vec::<String>::new()).with_stdin("hello"))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_lines_and_exit_code() {
        let runner = ProcessRunner::new();
        let (tx, mut rx) = mpsc::channel(16);
        let code = runner
            .stream(
                &CommandSpec::new("sh", ["-c", "echo one; echo two; exit 3"]),
                tx,
            )
            .await
            .unwrap();
        assert_eq!(code, 3);
        let mut got = Vec::new();
        while let Some(line) = rx.recv().await {
            got.push(line);
        }
        assert_eq!(got, vec!["one".to_string(), "two".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_invalid_utf8_and_long_lines() {
        let runner = ProcessRunner::new();
        let (tx, mut rx) = mpsc::channel(16);
        let script = "printf 'bad \\377\\376 bytes\\n'; head -c 70000 /dev/zero | tr '\\0' a; echo; echo done";
        let code = runner
            .stream(&CommandSpec::new("sh", ["-c", script]), tx)
            .await
            .unwrap();
        assert_eq!(code, 0);
        let mut got = Vec::new();
        while let Some(line) = rx.recv().await {
            got.push(line);
        }
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], "bad \u{FFFD}\u{FFFD} bytes");
        assert_eq!(got[1].len(), 70000);
        assert_eq!(got[2], "done");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropped_receiver_does_not_stall_the_child() {
        let runner = ProcessRunner::new();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let code = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            runner.stream(
                &CommandSpec::new("sh", ["-c", "yes output | head -n 100000; exit 4"]),
                tx,
            ),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(code, 4);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let runner = ProcessRunner::new();
        let err = runner
            .output(&CommandSpec::new("definitely-not-a-real-binary-xyz", Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
