//! In-process worker backend over duplex pipes.
//!
//! Every launch hands the worker end of the pipes to the test (or embedder)
//! through [`MemoryWorkers`], which then plays the worker's part of the line
//! protocol by hand.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::launcher::{WorkerControl, WorkerExit, WorkerLauncher, WorkerProcess};

const PIPE_CAPACITY: usize = 64 * 1024;
const FIRST_PID: u32 = 40_000;

pub struct MemoryLauncher {
    workers: mpsc::UnboundedSender<MemoryWorker>,
    auto_ready: bool,
    honor_terminate: bool,
    fail_next: AtomicU32,
    launches: AtomicU32,
}

/// Receiving end of [`MemoryLauncher`]: one [`MemoryWorker`] per launch.
pub struct MemoryWorkers {
    rx: mpsc::UnboundedReceiver<MemoryWorker>,
}

impl MemoryWorkers {
    pub async fn next(&mut self) -> Option<MemoryWorker> {
        self.rx.recv().await
    }
}

impl MemoryLauncher {
    pub fn new() -> (Self, MemoryWorkers) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                workers: tx,
                auto_ready: false,
                honor_terminate: true,
                fail_next: AtomicU32::new(0),
                launches: AtomicU32::new(0),
            },
            MemoryWorkers { rx },
        )
    }

    /// Every worker announces readiness as soon as it is launched.
    #[must_use]
    pub fn auto_ready(mut self) -> Self {
        self.auto_ready = true;
        self
    }

    /// Workers ignore termination requests and only end when killed.
    #[must_use]
    pub fn ignore_terminate(mut self) -> Self {
        self.honor_terminate = false;
        self
    }

    /// The next `n` launches fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLauncher for MemoryLauncher {
    async fn launch(&self, worker: &str, instance_id: Uuid) -> Result<WorkerProcess> {
        let attempt = self.launches.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("launch of '{worker}' refused");
        }

        let (supervisor_stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (supervisor_stdout, mut worker_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        if self.auto_ready {
            worker_stdout.write_all(b"{\"type\":\"ready\"}\n").await?;
        }

        let control = Arc::new(MemoryControl {
            pid: FIRST_PID + attempt,
            honor_terminate: self.honor_terminate,
            terminated: AtomicBool::new(false),
            exit: watch::Sender::new(None),
        });
        let handle = MemoryWorker {
            instance_id,
            input: BufReader::new(worker_stdin).lines(),
            output: worker_stdout,
            control: Arc::clone(&control),
        };
        if self.workers.send(handle).is_err() {
            tracing::debug!(worker = %worker, "no one is driving memory workers");
        }

        Ok(WorkerProcess {
            stdin: Box::new(supervisor_stdin),
            stdout: Box::new(supervisor_stdout),
            control,
        })
    }
}

struct MemoryControl {
    pid: u32,
    honor_terminate: bool,
    terminated: AtomicBool,
    exit: watch::Sender<Option<WorkerExit>>,
}

impl MemoryControl {
    fn finish(&self, exit: WorkerExit) {
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(exit);
            true
        });
    }
}

#[async_trait]
impl WorkerControl for MemoryControl {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate(&self) -> bool {
        self.terminated.store(true, Ordering::SeqCst);
        if self.honor_terminate {
            self.finish(WorkerExit::with_code(0));
        }
        true
    }

    async fn kill(&self) {
        self.finish(WorkerExit::killed());
    }

    async fn wait(&self) -> WorkerExit {
        let mut rx = self.exit.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or_else(WorkerExit::killed),
            Err(_) => WorkerExit::killed(),
        }
    }
}

/// The worker side of one launch.
pub struct MemoryWorker {
    instance_id: Uuid,
    input: Lines<BufReader<DuplexStream>>,
    output: DuplexStream,
    control: Arc<MemoryControl>,
}

impl MemoryWorker {
    pub fn pid(&self) -> u32 {
        self.control.pid
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        self.output.write_all(line.as_bytes()).await?;
        self.output.write_all(b"\n").await?;
        self.output.flush().await
    }

    pub async fn send(&mut self, frame: &Value) -> std::io::Result<()> {
        self.send_line(&frame.to_string()).await
    }

    /// Next line written by the supervisor, `None` once its input is closed.
    pub async fn recv_line(&mut self) -> std::io::Result<Option<String>> {
        self.input.next_line().await
    }

    /// Next JSON frame written by the supervisor.
    pub async fn recv(&mut self) -> Option<Value> {
        while let Ok(Some(line)) = self.input.next_line().await {
            if let Ok(value) = serde_json::from_str(&line) {
                return Some(value);
            }
        }
        None
    }

    /// Ends the worker with an exit code, as if it crashed or returned.
    pub fn exit(&self, code: i32) {
        self.control.finish(WorkerExit::with_code(code));
    }

    pub fn has_exited(&self) -> bool {
        self.control.exit.borrow().is_some()
    }

    pub fn was_terminated(&self) -> bool {
        self.control.terminated.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn launch_hands_over_connected_pipes() {
        let (launcher, mut workers) = MemoryLauncher::new();
        let mut process = launcher.launch("w", Uuid::now_v7()).await.unwrap();
        let mut worker = workers.next().await.unwrap();

        process.stdin.write_all(b"{\"type\":\"shutdown\"}\n").await.unwrap();
        assert_eq!(worker.recv().await.unwrap()["type"], "shutdown");

        worker.send_line("hello").await.unwrap();
        let mut buf = [0u8; 6];
        process.stdout.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");
    }

    #[tokio::test]
    async fn first_exit_wins() {
        let (launcher, mut workers) = MemoryLauncher::new();
        let process = launcher.launch("w", Uuid::now_v7()).await.unwrap();
        let worker = workers.next().await.unwrap();

        worker.exit(2);
        process.control.kill().await;
        assert_eq!(process.control.wait().await.code, Some(2));
    }

    #[tokio::test]
    async fn ignored_terminate_needs_kill() {
        let (launcher, mut workers) = MemoryLauncher::new();
        let launcher = launcher.ignore_terminate();
        let process = launcher.launch("w", Uuid::now_v7()).await.unwrap();
        let worker = workers.next().await.unwrap();

        assert!(process.control.terminate());
        assert!(worker.was_terminated());
        assert!(!worker.has_exited());
        process.control.kill().await;
        assert!(worker.has_exited());
    }

    #[tokio::test]
    async fn refused_launches_are_counted() {
        let (launcher, _workers) = MemoryLauncher::new();
        launcher.fail_next(1);
        assert!(launcher.launch("w", Uuid::now_v7()).await.is_err());
        assert!(launcher.launch("w", Uuid::now_v7()).await.is_ok());
        assert_eq!(launcher.launches(), 2);
    }
}
