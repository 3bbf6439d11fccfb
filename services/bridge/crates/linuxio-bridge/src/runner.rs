//! External command execution with timeout and guaranteed process kill.
//!
//! Every tool the bridge shells out to (`pvs`, `lvcreate`, `mount`, `nmcli`,
//! `journalctl`, `systemctl`) goes through this trait so handlers can be
//! tested with canned doubles instead of real processes.

use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

/// Default timeout for short-lived administrative tools.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command with the default timeout.
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output>;

    /// Run a command with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the process fails to spawn or the timeout fires;
    /// on timeout the child is killed before the error is returned.
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output>;

    /// Run a command with stdin piped from `input`.
    async fn run_with_stdin(&self, program: &str, args: &[&str], input: &[u8]) -> Result<Output>;

    /// Spawn a long-lived command with piped stdout. No timeout — the caller
    /// owns the child's lifetime; `kill_on_drop(true)` is the safety net.
    ///
    /// # Errors
    ///
    /// Returns an error if the process fails to spawn.
    fn spawn(&self, program: &str, args: &[&str]) -> Result<tokio::process::Child>;
}

/// Production runner backed by tokio.
///
/// `tokio::time::timeout` around `.output().await` does not kill the child
/// when the timeout fires, so this uses `tokio::select!` with an explicit
/// `child.kill()`. Stdout and stderr are read concurrently with `wait()` —
/// a child that writes more than the pipe buffer would otherwise deadlock.
#[derive(Debug, Clone)]
pub struct TokioRunner {
    timeout: Duration,
}

impl Default for TokioRunner {
    fn default() -> Self {
        TokioRunner {
            timeout: DEFAULT_CMD_TIMEOUT,
        }
    }
}

impl TokioRunner {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        TokioRunner { timeout }
    }
}

#[async_trait]
impl CommandRunner for TokioRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        self.run_with_timeout(program, args, self.timeout).await
    }

    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stdout_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stderr_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                );
                Ok(Output {
                    status: status.with_context(|| format!("waiting for {program}"))?,
                    stdout,
                    stderr,
                })
            } => result,
            () = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                anyhow::bail!("{program} timed out after {}s", timeout.as_secs())
            }
        }
    }

    async fn run_with_stdin(&self, program: &str, args: &[&str], input: &[u8]) -> Result<Output> {
        use tokio::io::AsyncWriteExt;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let stdin_handle = child.stdin.take();
        let input_owned = input.to_vec();
        let stdin_task = tokio::spawn(async move {
            if let Some(mut stdin) = stdin_handle {
                let _ = stdin.write_all(&input_owned).await;
            }
        });

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stdout_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stderr_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                );
                let _ = stdin_task.await;
                Ok(Output {
                    status: status.with_context(|| format!("waiting for {program}"))?,
                    stdout,
                    stderr,
                })
            } => result,
            () = tokio::time::sleep(self.timeout) => {
                let _ = child.kill().await;
                anyhow::bail!("{program} timed out after {}s", self.timeout.as_secs())
            }
        }
    }

    fn spawn(&self, program: &str, args: &[&str]) -> Result<tokio::process::Child> {
        tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))
    }
}
