//! External command boundary
//!
//! Every docker invocation goes through a [`CommandRunner`]. The process
//! runner streams output into the log and bounds each command with a
//! timeout; the recording runner captures invocations for tests and dry
//! runs.

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

/// A command line plus the directory it runs in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl CommandSpec {
    pub fn new(program: &str, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: cwd.into(),
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

    /// `<docker> compose <args..>` in `cwd`
    pub fn compose<'a>(docker: &str, cwd: &Path, args: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(docker, cwd).arg("compose").args(args)
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Executes commands and reports only their exit status
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec) -> Result<()>;
}

/// Runs commands as child processes
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<()> {
        info!(command = %spec, cwd = %spec.cwd.display(), "Running command");
        let start = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| Error::io(&spec.cwd, e))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = tokio::time::timeout(self.timeout, async {
            if let (Some(stdout), Some(stderr)) = (stdout, stderr) {
                forward_output(stdout, stderr).await;
            }
            child.wait().await
        })
        .await;

        let status = match finished {
            Ok(status) => status.map_err(|e| Error::io(&spec.cwd, e))?,
            Err(_) => {
                warn!(command = %spec, timeout_secs = self.timeout.as_secs(), "Command timed out, killing");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill command: {}", e);
                }
                return Err(Error::CommandTimeout {
                    command: spec.to_string(),
                    cwd: spec.cwd.clone(),
                    timeout: self.timeout,
                });
            }
        };

        let duration = start.elapsed().as_secs_f64();
        if !status.success() {
            warn!(command = %spec, code = ?status.code(), duration_secs = duration, "Command failed");
            return Err(Error::CommandFailure {
                command: spec.to_string(),
                cwd: spec.cwd.clone(),
                code: status.code(),
            });
        }

        debug!(command = %spec, duration_secs = duration, "Command finished");
        Ok(())
    }
}

/// Forward both output streams to the log until each reaches EOF
async fn forward_output(stdout: ChildStdout, stderr: ChildStderr) {
    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !(stdout_done && stderr_done) {
        tokio::select! {
            line = stdout_reader.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => debug!(target: "compose", "{}", line),
                    Ok(None) => stdout_done = true,
                    Err(e) => {
                        warn!("Error reading stdout: {}", e);
                        stdout_done = true;
                    }
                }
            }
            line = stderr_reader.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => debug!(target: "compose", "{}", line),
                    Ok(None) => stderr_done = true,
                    Err(e) => {
                        warn!("Error reading stderr: {}", e);
                        stderr_done = true;
                    }
                }
            }
        }
    }
}

/// Records commands instead of running them.
///
/// Commands whose rendered line contains a pattern registered with
/// [`RecordingRunner::fail_on`] are recorded and then fail with exit code 1.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<CommandSpec>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every command whose line contains `pattern` (builder pattern)
    pub fn fail_on(self, pattern: &str) -> Self {
        self.failures.lock().push(pattern.to_string());
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    /// Recorded command lines, in order
    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().iter().map(ToString::to_string).collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<()> {
        self.calls.lock().push(spec.clone());

        let line = spec.to_string();
        if self.failures.lock().iter().any(|p| line.contains(p.as_str())) {
            return Err(Error::CommandFailure {
                command: line,
                cwd: spec.cwd.clone(),
                code: Some(1),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_display() {
        let spec = CommandSpec::compose("docker", Path::new("upstream/whoami"), ["up", "-d"]);
        assert_eq!(spec.to_string(), "docker compose up -d");
        assert_eq!(spec.cwd, PathBuf::from("upstream/whoami"));
    }

    #[tokio::test]
    async fn test_recording_runner_records_in_order() {
        let runner = RecordingRunner::new();
        runner
            .run(&CommandSpec::compose("docker", Path::new("a"), ["pull"]))
            .await
            .unwrap();
        runner
            .run(&CommandSpec::compose("docker", Path::new("a"), ["up", "-d"]))
            .await
            .unwrap();

        assert_eq!(runner.commands(), vec!["docker compose pull", "docker compose up -d"]);

        runner.clear();
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_recording_runner_injected_failure() {
        let runner = RecordingRunner::new().fail_on("pull");
        let err = runner
            .run(&CommandSpec::compose("docker", Path::new("a"), ["pull"]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CommandFailure { code: Some(1), .. }));
        assert_eq!(runner.calls().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_success() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = ProcessRunner::new(Duration::from_secs(10));
        let spec = CommandSpec::new("sh", tmp.path()).args(["-c", "echo hello; echo oops >&2"]);

        runner.run(&spec).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_failure_exit_code() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = ProcessRunner::new(Duration::from_secs(10));
        let spec = CommandSpec::new("sh", tmp.path()).args(["-c", "exit 3"]);

        match runner.run(&spec).await.unwrap_err() {
            Error::CommandFailure { code, cwd, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(cwd, tmp.path());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_timeout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = ProcessRunner::new(Duration::from_millis(200));
        let spec = CommandSpec::new("sleep", tmp.path()).arg("5");

        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
    }

    #[tokio::test]
    async fn test_process_runner_missing_program() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let spec = CommandSpec::new("stackgate-no-such-binary", tmp.path());

        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
