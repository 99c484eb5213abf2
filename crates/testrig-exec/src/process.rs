//! Child process execution.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use testrig_core::{Result, RunError};
use tokio::process::Command;
use tracing::debug;

/// A fully described child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment. Values may be secrets and are never logged.
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Only tooling processes get a timeout; engine runs are never cut short.
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Extra environment; values are never logged.
    pub fn env(mut self, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(pairs);
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Kill the child after `timeout`. `None` waits forever.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `-1` when terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ProcessOutput {
    /// Exit code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `lines` non-empty lines of stderr.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let tail: Vec<&str> = self
            .stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        tail[tail.len().saturating_sub(lines)..].join("\n")
    }
}

/// Run a process to completion.
///
/// A spawn failure is a [`RunError::ProcessLaunch`]; a timeout is a
/// [`RunError::TransientTooling`] and kills the child.
pub async fn run_process(spec: &ProcessSpec) -> Result<ProcessOutput> {
    let start = Instant::now();

    let env_keys: Vec<&str> = spec.env.iter().map(|(k, _)| k.as_str()).collect();
    debug!(
        program = %spec.program.display(),
        args = ?spec.args,
        env = ?env_keys,
        "spawning process"
    );

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let child = command.spawn().map_err(|source| RunError::ProcessLaunch {
        program: spec.program.clone(),
        source,
    })?;

    let output = match spec.timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| {
                RunError::transient(format!(
                    "{} timed out after {} seconds",
                    spec.program.display(),
                    limit.as_secs()
                ))
            })??,
        None => child.wait_with_output().await?,
    };

    Ok(ProcessOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}
