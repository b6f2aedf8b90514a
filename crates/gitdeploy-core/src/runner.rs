//! External command execution.
//!
//! Every command runs with an explicit working directory and its own
//! wall-clock budget. stdout and stderr are merged line by line in arrival
//! order. [`execute`] layers the critical / non-critical policy and transcript
//! recording on top of any [`CommandRunner`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::{DeployError, Result};
use crate::transcript::RunOutput;

/// One command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory for this invocation only.
    pub cwd: PathBuf,
    /// A non-zero exit of a critical command aborts the run.
    pub critical: bool,
}

impl CommandSpec {
    /// A critical command with no arguments.
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            critical: true,
        }
    }

    /// `sh -c <script>` in `cwd`.
    pub fn shell(script: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self::new("sh", cwd).arg("-c").arg(script)
    }

    /// `git <args>` in `cwd`.
    pub fn git<I, S>(args: I, cwd: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("git", cwd).args(args)
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

    /// Record the exit status only.
    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Human-readable command line. `sh -c` scripts display as the script.
    pub fn display(&self) -> String {
        if self.program == "sh" && self.args.len() == 2 && self.args[0] == "-c" {
            return self.args[1].clone();
        }
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `-1` when terminated by a signal.
    pub exit_code: i32,
    /// stdout and stderr merged, one entry per line, newline-joined.
    pub output: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines()
    }
}

/// Runs commands. Implemented over tokio processes by [`ProcessRunner`];
/// tests substitute scripted runners.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion within `time_limit`.
    ///
    /// A non-zero exit is not an error at this layer. Errors are spawn
    /// failures ([`DeployError::Environment`] when the program is missing)
    /// and [`DeployError::Timeout`].
    async fn run(&self, spec: &CommandSpec, time_limit: Duration) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec, time_limit: Duration) -> Result<CommandOutput> {
        let start = Instant::now();
        debug!(command = %spec, cwd = %spec.cwd.display(), "spawning");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(spec, e))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }
        drop(tx);

        let mut lines = Vec::new();
        let finished = tokio::time::timeout(time_limit, async {
            while let Some(line) = rx.recv().await {
                lines.push(line);
            }
            child.wait().await
        })
        .await;

        let status = match finished {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(command = %spec, error = %e, "failed to kill timed-out command");
                }
                while let Ok(line) = rx.try_recv() {
                    lines.push(line);
                }
                return Err(DeployError::Timeout {
                    command: spec.display(),
                    limit_secs: time_limit.as_secs(),
                    partial_output: lines.join("\n"),
                });
            }
        };

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            output: lines.join("\n"),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn spawn_error(spec: &CommandSpec, err: std::io::Error) -> DeployError {
    if err.kind() == std::io::ErrorKind::NotFound && spec.cwd.is_dir() {
        DeployError::Environment {
            tool: spec.program.clone(),
        }
    } else {
        DeployError::Io(err)
    }
}

/// Pump lines from a pipe into the shared channel. Invalid UTF-8 is replaced.
fn forward_lines<R>(pipe: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Run `spec`, record it in `out`, and apply the critical policy.
///
/// Returns [`DeployError::CommandFailed`] when a critical command exits
/// non-zero. Spawn errors and timeouts are recorded as errors and propagated;
/// a timed-out command is also recorded with the output it produced.
pub async fn execute(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    time_limit: Duration,
    out: &mut RunOutput,
) -> Result<CommandOutput> {
    match runner.run(spec, time_limit).await {
        Ok(result) => {
            out.record_command(spec, &result);
            if spec.critical && !result.success() {
                return Err(DeployError::CommandFailed {
                    command: spec.display(),
                    exit_code: result.exit_code,
                });
            }
            Ok(result)
        }
        Err(err) => {
            if let DeployError::Timeout { partial_output, .. } = &err {
                let partial = CommandOutput {
                    exit_code: -1,
                    output: partial_output.clone(),
                    duration_ms: time_limit.as_millis() as u64,
                };
                out.record_command(spec, &partial);
            }
            out.error(format!("$ {spec}: {err}"));
            Err(err)
        }
    }
}

/// Whether `program` can be spawned from `cwd`; returns its first
/// `--version` line.
pub async fn probe_tool(
    runner: &dyn CommandRunner,
    program: &str,
    cwd: &Path,
    time_limit: Duration,
) -> Result<String> {
    let spec = CommandSpec::new(program, cwd).arg("--version").non_critical();
    let result = runner.run(&spec, time_limit).await?;
    let first = result.lines().next().unwrap_or_default().trim().to_string();
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[test]
    fn test_display_quotes_whitespace() {
        let spec = CommandSpec::git(["log", "--pretty=format:%H", "origin/main"], "/tmp");
        assert_eq!(spec.display(), "git log --pretty=format:%H origin/main");

        let spec = CommandSpec::new("echo", "/tmp").arg("two words").arg("");
        assert_eq!(spec.display(), "echo 'two words' ''");

        let spec = CommandSpec::shell("composer install --no-dev", "/tmp");
        assert_eq!(spec.display(), "composer install --no-dev");
    }

    #[tokio::test]
    async fn test_runs_in_given_directory() {
        let dir = tmp();
        let spec = CommandSpec::shell("pwd", dir.path());
        let result = ProcessRunner
            .run(&spec, Duration::from_secs(10))
            .await
            .expect("run");
        assert!(result.success());
        let reported = std::fs::canonicalize(result.output.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_merges_stdout_and_stderr() {
        let dir = tmp();
        let spec = CommandSpec::shell("echo out; echo err >&2; exit 3", dir.path());
        let result = ProcessRunner
            .run(&spec, Duration::from_secs(10))
            .await
            .expect("run");
        assert_eq!(result.exit_code, 3);
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let dir = tmp();
        let spec = CommandSpec::new("sleep", dir.path()).arg("5");
        let start = Instant::now();
        let err = ProcessRunner
            .run(&spec, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Timeout { .. }), "{err:?}");
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let dir = tmp();
        let mut out = RunOutput::new("run-1");
        let spec = CommandSpec::shell("echo started; sleep 5", dir.path());
        let err = execute(&ProcessRunner, &spec, Duration::from_millis(500), &mut out)
            .await
            .unwrap_err();
        let DeployError::Timeout { partial_output, .. } = &err else {
            panic!("expected timeout, got {err:?}");
        };
        assert!(partial_output.contains("started"), "{partial_output:?}");

        let record = out.commands().next().expect("timed-out command recorded");
        assert_eq!(record.exit_code, -1);
        assert!(record.output.contains("started"));
        assert!(out.render().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_program_is_environment_error() {
        let dir = tmp();
        let spec = CommandSpec::new("gitdeploy-no-such-binary", dir.path());
        let err = ProcessRunner
            .run(&spec, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Environment { ref tool } if tool == "gitdeploy-no-such-binary"));
    }

    #[tokio::test]
    async fn test_execute_applies_critical_policy() {
        let dir = tmp();
        let mut out = RunOutput::new("run-1");

        let soft = CommandSpec::shell("exit 1", dir.path()).non_critical();
        let result = execute(&ProcessRunner, &soft, Duration::from_secs(5), &mut out)
            .await
            .expect("non-critical failure is not an error");
        assert_eq!(result.exit_code, 1);

        let hard = CommandSpec::shell("exit 2", dir.path());
        let err = execute(&ProcessRunner, &hard, Duration::from_secs(5), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::CommandFailed { exit_code: 2, .. }));
        assert_eq!(out.command_count(), 2);
    }
}
