//! Child-process execution for external tools.
//!
//! The unpack/repack tools are untrusted: they hang, ignore shutdown
//! requests, and report success inaccurately. Everything that talks to them
//! goes through [`CommandRunner`], a narrow seam that the extractor and
//! recompiler logic can be tested against without spawning real processes.
//!
//! Timeout, cancellation, and non-zero exit are three distinct outcomes; a
//! caller must never mistake a user cancel for a broken tool.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

/// What to run: executable, arguments, working directory, timeout.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub exe: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(exe: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            exe: exe.into(),
            args: Vec::new(),
            cwd: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Captured result of a completed child process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Ways a run can fail before producing an exit status.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Failed to start {exe}: {source}")]
    Spawn {
        exe: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Run cancelled")]
    Cancelled,
}

/// Narrow abstraction over child-process execution.
///
/// A non-zero exit is a successful *run* (the tool was executed and
/// reported); only spawn failures, timeouts, and cancellation are errors.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        spec: CommandSpec,
        cancel: watch::Receiver<bool>,
    ) -> impl Future<Output = Result<CommandOutput, CommandError>> + Send;
}

/// Real implementation on top of `tokio::process`.
///
/// The child is spawned with `kill_on_drop`, so a timeout or cancellation
/// force-terminates it rather than waiting for a tool that does not honor
/// external shutdown requests.
#[derive(Debug, Default, Clone)]
pub struct TokioCommandRunner;

impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        spec: CommandSpec,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<CommandOutput, CommandError> {
        if *cancel.borrow() {
            return Err(CommandError::Cancelled);
        }

        let mut cmd = tokio::process::Command::new(&spec.exe);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        debug!("Running {} {:?}", spec.exe.display(), spec.args);

        let child = cmd.spawn().map_err(|source| CommandError::Spawn {
            exe: spec.exe.clone(),
            source,
        })?;

        // Dropping the unfinished wait future kills the child, so both the
        // timeout and the cancel arm leave no orphan behind.
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                warn!("Cancelling {}", spec.exe.display());
                return Err(CommandError::Cancelled);
            }
            res = tokio::time::timeout(spec.timeout, &mut wait) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(CommandError::Spawn { exe: spec.exe.clone(), source: e });
                }
                Err(_) => {
                    warn!(
                        "{} exceeded {:?}, killing process",
                        spec.exe.display(),
                        spec.timeout
                    );
                    return Err(CommandError::Timeout(spec.timeout));
                }
            },
        };

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Resolves once the cancel flag flips to true. A dropped sender means no
/// cancellation can ever arrive, so the future stays pending rather than
/// resolving spuriously.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A never-fired cancel receiver, for callers without a cancellation source.
pub fn no_cancel() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}
