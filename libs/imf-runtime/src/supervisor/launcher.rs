//! Process backends for the supervisor.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::log_forwarder::spawn_log_forwarder;
use crate::config::WorkerConfig;

/// How long stderr forwarding may lag behind process exit before it is cut.
const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub detail: String,
}

impl WorkerExit {
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            detail: format!("exit code {code}"),
        }
    }

    pub fn killed() -> Self {
        Self {
            code: None,
            detail: "killed".to_owned(),
        }
    }

    fn from_status(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                detail: status.to_string(),
            },
            Err(e) => Self {
                code: None,
                detail: format!("wait failed: {e}"),
            },
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            detail: "exit status unavailable".to_owned(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

/// Lifecycle control over one launched worker.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Asks the worker to terminate. Returns `false` when no graceful
    /// mechanism is available, in which case the caller should [`kill`](Self::kill).
    fn terminate(&self) -> bool;

    /// Forces termination and waits for the exit to be observed.
    async fn kill(&self);

    /// Resolves once the worker has exited. May be awaited concurrently.
    async fn wait(&self) -> WorkerExit;
}

/// A launched worker: its stdio and its control handle.
pub struct WorkerProcess {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Arc<dyn WorkerControl>,
}

/// Seam for the process backend.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, worker: &str, instance_id: Uuid) -> Result<WorkerProcess>;
}

/// Spawns the worker as a local child process.
///
/// stdin and stdout carry the line protocol; stderr is forwarded to tracing.
#[derive(Debug, Clone)]
pub struct LocalProcessLauncher {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_directory: Option<PathBuf>,
}

impl LocalProcessLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_directory: None,
        }
    }

    pub fn from_config(cfg: &WorkerConfig) -> Self {
        Self {
            program: cfg.program.clone(),
            args: cfg.args.clone(),
            env: cfg.env.clone(),
            working_directory: cfg.working_directory.clone(),
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

#[async_trait]
impl WorkerLauncher for LocalProcessLauncher {
    async fn launch(&self, worker: &str, instance_id: Uuid) -> Result<WorkerProcess> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            // Python block-buffers a piped stdout otherwise.
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_directory {
            if dir.is_dir() {
                cmd.current_dir(dir);
            } else {
                tracing::warn!(
                    worker = %worker,
                    working_dir = %dir.display(),
                    "working directory does not exist, using current dir"
                );
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;
        let pid = child.id();

        let stdin = child.stdin.take().context("worker stdin is not piped")?;
        let stdout = child.stdout.take().context("worker stdout is not piped")?;
        let forwarder_cancel = CancellationToken::new();
        if let Some(stderr) = child.stderr.take() {
            spawn_log_forwarder(
                stderr,
                worker.to_owned(),
                instance_id,
                pid,
                forwarder_cancel.clone(),
            );
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        let kill_signal = Arc::clone(&kill);
        let worker_name = worker.to_owned();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                () = kill_signal.notified() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(worker = %worker_name, error = %e, "failed to kill worker");
                    }
                    child.wait().await
                }
            };
            let exit = WorkerExit::from_status(status);
            tracing::debug!(worker = %worker_name, worker_pid = ?pid, exit = %exit, "worker process exited");
            exit_tx.send_replace(Some(exit));

            tokio::time::sleep(FORWARDER_DRAIN_TIMEOUT).await;
            forwarder_cancel.cancel();
        });

        tracing::info!(worker = %worker, worker_instance = %instance_id, worker_pid = ?pid, program = %self.program, "spawned worker process");

        Ok(WorkerProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            control: Arc::new(LocalControl {
                pid,
                kill,
                exit: exit_rx,
            }),
        })
    }
}

struct LocalControl {
    pid: Option<u32>,
    kill: Arc<Notify>,
    exit: watch::Receiver<Option<WorkerExit>>,
}

impl LocalControl {
    #[cfg(unix)]
    fn send_sigterm(&self) -> bool {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return false;
        };
        let Ok(raw) = i32::try_from(pid) else {
            tracing::warn!(pid, "pid does not fit in i32, cannot send SIGTERM");
            return false;
        };
        kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok()
    }

    #[cfg(not(unix))]
    fn send_sigterm(&self) -> bool {
        false
    }
}

#[async_trait]
impl WorkerControl for LocalControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self) -> bool {
        if self.exit.borrow().is_some() {
            return true;
        }
        self.send_sigterm()
    }

    async fn kill(&self) {
        self.kill.notify_one();
        self.wait().await;
    }

    async fn wait(&self) -> WorkerExit {
        let mut rx = self.exit.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or_else(WorkerExit::unknown),
            Err(_) => WorkerExit::unknown(),
        }
    }
}
