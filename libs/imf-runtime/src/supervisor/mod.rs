//! Supervision of the external monitor worker.
//!
//! The [`ProcessSupervisor`] owns at most one worker process at a time. It
//! spawns it through a [`WorkerLauncher`], waits for readiness, correlates
//! commands with responses, republishes telemetry as [`Event`]s and restarts
//! the worker with exponential backoff when it exits unexpectedly.
//!
//! Lifecycle operations (`start`, `stop`, `restart` and automatic restarts)
//! are serialized by one async lock. Everything else (state, pending commands,
//! the current session) sits behind a short synchronous lock that is never
//! held across an await.

mod backoff;
mod error;
mod launcher;
mod log_forwarder;
#[cfg(any(test, feature = "test-util"))]
mod memory;
mod protocol;
mod state;

pub use backoff::BackoffPolicy;
pub use error::SupervisorError;
pub use launcher::{LocalProcessLauncher, WorkerControl, WorkerExit, WorkerLauncher, WorkerProcess};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryLauncher, MemoryWorker, MemoryWorkers};
pub use protocol::{Inbound, Outbound, ProtocolError};
pub use state::{ProcessState, SupervisorStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::contracts::Service;
use crate::events::{Event, EventKind, EventSink};
use crate::registry::{InitContext, ServiceDescriptor};

/// Registry name of the monitor worker service.
pub const SERVICE_NAME: &str = "python-monitor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    pub command_timeout: Duration,
    pub heartbeat_timeout: Option<Duration>,
    pub backoff: BackoffPolicy,
    /// Consecutive crashes tolerated before the worker is marked failed.
    pub max_restarts: u32,
    pub stable_after: Duration,
}

impl From<&WorkerConfig> for SupervisorSettings {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            startup_timeout: cfg.startup_timeout(),
            stop_grace: cfg.stop_grace(),
            command_timeout: cfg.command_timeout(),
            heartbeat_timeout: cfg.heartbeat_timeout(),
            backoff: cfg.restart.backoff(),
            max_restarts: cfg.restart.max_restarts,
            stable_after: cfg.restart.stable_after(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

/// A command awaiting its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCommandInfo {
    pub id: u64,
    pub name: String,
    pub issued_at: DateTime<Utc>,
}

struct PendingCommand {
    name: String,
    issued_at: DateTime<Utc>,
    tx: oneshot::Sender<Result<Value, SupervisorError>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchOrigin {
    Explicit,
    Restart,
}

struct Session {
    instance_id: Uuid,
    pid: Option<u32>,
    writer: mpsc::UnboundedSender<String>,
    control: Arc<dyn WorkerControl>,
    ready: Option<oneshot::Sender<()>>,
    reader_cancel: CancellationToken,
}

struct Core {
    state: ProcessState,
    restart_count: u32,
    consecutive_crashes: u32,
    last_error: Option<String>,
    next_command_id: u64,
    pending: HashMap<u64, PendingCommand>,
    session: Option<Session>,
    /// Bumped whenever a session is retired; output and exits of older
    /// generations are ignored.
    generation: u64,
    origin: LaunchOrigin,
    running_since: Option<Instant>,
    last_seen: Option<Instant>,
    restart_cancel: Option<CancellationToken>,
    draining: bool,
}

struct Shared {
    name: String,
    settings: SupervisorSettings,
    launcher: Arc<dyn WorkerLauncher>,
    events: EventSink,
    shutdown: CancellationToken,
    core: Mutex<Core>,
    op_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<ProcessState>,
    drained: Notify,
}

/// Owner of one external worker process. Cheap to clone.
#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    /// `shutdown` cancels any pending automatic restart, e.g. when the
    /// application is shutting down.
    pub fn new(
        name: impl Into<String>,
        settings: SupervisorSettings,
        launcher: Arc<dyn WorkerLauncher>,
        events: EventSink,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                settings,
                launcher,
                events,
                shutdown,
                core: Mutex::new(Core {
                    state: ProcessState::Stopped,
                    restart_count: 0,
                    consecutive_crashes: 0,
                    last_error: None,
                    next_command_id: 0,
                    pending: HashMap::new(),
                    session: None,
                    generation: 0,
                    origin: LaunchOrigin::Explicit,
                    running_since: None,
                    last_seen: None,
                    restart_cancel: None,
                    draining: false,
                }),
                op_lock: tokio::sync::Mutex::new(()),
                state_tx: watch::Sender::new(ProcessState::Stopped),
                drained: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    pub fn state(&self) -> ProcessState {
        self.shared.core.lock().state
    }

    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.shared.state_tx.subscribe()
    }

    pub fn get_status(&self) -> SupervisorStatus {
        self.shared.status_of(&self.shared.core.lock())
    }

    /// Spawns the worker and resolves once it is ready.
    ///
    /// No-op while starting or running. From any other state the restart
    /// budget is renewed and a pending automatic restart is superseded.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let _op = self.shared.op_lock.lock().await;
        {
            let mut core = self.shared.core.lock();
            if matches!(core.state, ProcessState::Starting | ProcessState::Running) {
                return Ok(());
            }
            if let Some(token) = core.restart_cancel.take() {
                token.cancel();
            }
            core.consecutive_crashes = 0;
        }
        self.shared.launch(LaunchOrigin::Explicit).await
    }

    /// Drains in-flight commands, asks the worker to exit, waits up to the
    /// grace period and then kills it. Always ends `Stopped`.
    pub async fn stop(&self) {
        let _op = self.shared.op_lock.lock().await;
        self.shared.stop_locked().await;
    }

    /// `stop` followed by `start`. An explicit restart does not consume the
    /// crash budget.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let _op = self.shared.op_lock.lock().await;
        self.shared.stop_locked().await;
        self.shared.core.lock().consecutive_crashes = 0;
        self.shared.launch(LaunchOrigin::Explicit).await
    }

    pub async fn send_command(&self, name: &str, args: Value) -> Result<Value, SupervisorError> {
        self.send_command_with_timeout(name, args, self.shared.settings.command_timeout)
            .await
    }

    /// Sends a command and waits for the correlated response.
    ///
    /// Commands are written in call order and may complete in any order. The
    /// pending entry is removed whatever the outcome, including when the
    /// caller drops this future.
    pub async fn send_command_with_timeout(
        &self,
        name: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, SupervisorError> {
        let shared = &self.shared;
        let deadline = Instant::now() + timeout;
        let (id, rx) = {
            let mut guard = shared.core.lock();
            let core = &mut *guard;
            let session = match (&core.session, core.state, core.draining) {
                (Some(session), ProcessState::Running, false) => session,
                _ => {
                    return Err(SupervisorError::ProcessNotRunning {
                        worker: shared.name.clone(),
                        state: core.state,
                    });
                }
            };

            core.next_command_id += 1;
            let id = core.next_command_id;
            let line = protocol::command_frame(id, name, &args, timeout)
                .map_err(|e| SupervisorError::Encode(e.to_string()))?;
            if session.writer.send(line).is_err() {
                return Err(SupervisorError::CommandFailure {
                    id,
                    name: name.to_owned(),
                    reason: "worker input is closed".to_owned(),
                });
            }

            let (tx, rx) = oneshot::channel();
            core.pending.insert(
                id,
                PendingCommand {
                    name: name.to_owned(),
                    issued_at: Utc::now(),
                    tx,
                },
            );
            (id, rx)
        };
        let _pending = PendingGuard { shared, id };
        tracing::debug!(worker = %shared.name, command = %name, id, "command dispatched");

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SupervisorError::CommandFailure {
                id,
                name: name.to_owned(),
                reason: "worker session ended".to_owned(),
            }),
            Err(_) => {
                tracing::warn!(
                    worker = %shared.name,
                    command = %name,
                    id,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "command timed out"
                );
                Err(SupervisorError::CommandTimeout {
                    id,
                    name: name.to_owned(),
                    timeout,
                })
            }
        }
    }

    pub fn has_pending(&self, id: u64) -> bool {
        self.shared.core.lock().pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.core.lock().pending.len()
    }

    pub fn pending_commands(&self) -> Vec<PendingCommandInfo> {
        let core = self.shared.core.lock();
        let mut out: Vec<_> = core
            .pending
            .iter()
            .map(|(id, p)| PendingCommandInfo {
                id: *id,
                name: p.name.clone(),
                issued_at: p.issued_at,
            })
            .collect();
        out.sort_by_key(|p| p.id);
        out
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Removes a pending entry when its caller is done with it.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut core = self.shared.core.lock();
        if core.pending.remove(&self.id).is_some() && core.pending.is_empty() {
            self.shared.drained.notify_waiters();
        }
    }
}

impl Shared {
    fn status_of(&self, core: &Core) -> SupervisorStatus {
        SupervisorStatus {
            worker: self.name.clone(),
            state: core.state,
            restart_count: core.restart_count,
            consecutive_crashes: core.consecutive_crashes,
            last_error: core.last_error.clone(),
            pid: core.session.as_ref().and_then(|s| s.pid),
            instance_id: core.session.as_ref().map(|s| s.instance_id),
            pending_commands: core.pending.len(),
        }
    }

    /// Changes state and publishes the resulting status. Called with the
    /// core lock held so events leave in transition order.
    fn transition(&self, core: &mut Core, next: ProcessState) {
        let prev = core.state;
        if prev == next {
            return;
        }
        core.state = next;
        self.state_tx.send_replace(next);
        tracing::info!(worker = %self.name, from = %prev, to = %next, "worker state changed");

        let status = self.status_of(core);
        match serde_json::to_value(&status) {
            Ok(payload) => {
                self.events.publish(Event::status(payload));
            }
            Err(e) => tracing::warn!(worker = %self.name, error = %e, "failed to encode status event"),
        }
    }

    fn fail_pending(&self, core: &mut Core, error: impl Fn(u64, String) -> SupervisorError) {
        if core.pending.is_empty() {
            return;
        }
        for (id, pending) in core.pending.drain() {
            if pending.tx.send(Err(error(id, pending.name))).is_err() {
                tracing::trace!(worker = %self.name, id, "command caller already gone");
            }
        }
        self.drained.notify_waiters();
    }

    /// Spawns a worker and waits for readiness. Requires `op_lock`.
    async fn launch(self: &Arc<Self>, origin: LaunchOrigin) -> Result<(), SupervisorError> {
        let instance_id = Uuid::now_v7();
        let generation = {
            let mut core = self.core.lock();
            core.generation += 1;
            core.origin = origin;
            core.running_since = None;
            core.last_seen = None;
            self.transition(&mut core, ProcessState::Starting);
            core.generation
        };

        let process = match self.launcher.launch(&self.name, instance_id).await {
            Ok(process) => process,
            Err(e) => {
                let reason = format!("{e:#}");
                tracing::error!(worker = %self.name, error = %reason, "failed to spawn worker");
                let mut core = self.core.lock();
                if origin == LaunchOrigin::Restart {
                    self.handle_crash(&mut core, &reason);
                } else {
                    core.last_error = Some(reason.clone());
                    self.transition(&mut core, ProcessState::Failed);
                }
                return Err(self.spawn_error(reason));
            }
        };

        let WorkerProcess {
            stdin,
            stdout,
            control,
        } = process;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let reader_cancel = CancellationToken::new();
        {
            let mut core = self.core.lock();
            core.session = Some(Session {
                instance_id,
                pid: control.pid(),
                writer: writer_tx,
                control: Arc::clone(&control),
                ready: Some(ready_tx),
                reader_cancel: reader_cancel.clone(),
            });
        }

        tokio::spawn(write_loop(self.name.clone(), stdin, writer_rx));
        tokio::spawn(read_loop(Arc::clone(self), generation, stdout, reader_cancel));
        tokio::spawn(watch_exit(Arc::clone(self), generation, Arc::clone(&control)));
        tracing::debug!(
            worker = %self.name,
            worker_instance = %instance_id,
            worker_pid = ?control.pid(),
            "waiting for worker readiness"
        );

        match tokio::time::timeout(self.settings.startup_timeout, ready_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                let reason = self
                    .core
                    .lock()
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "worker exited before becoming ready".to_owned());
                Err(self.spawn_error(reason))
            }
            Err(_) => {
                let reason = format!(
                    "worker did not become ready within {}ms",
                    self.settings.startup_timeout.as_millis()
                );
                self.abandon_startup(generation, &reason).await;
                Err(self.spawn_error(reason))
            }
        }
    }

    /// Fails a launch that missed its startup deadline and kills the worker.
    async fn abandon_startup(&self, generation: u64, reason: &str) {
        let session = {
            let mut core = self.core.lock();
            if core.generation != generation || core.state != ProcessState::Starting {
                return;
            }
            core.generation += 1;
            core.last_error = Some(reason.to_owned());
            let session = core.session.take();
            self.transition(&mut core, ProcessState::Failed);
            session
        };
        if let Some(session) = session {
            tracing::error!(worker = %self.name, error = %reason, "startup deadline expired; killing worker");
            session.reader_cancel.cancel();
            session.control.kill().await;
        }
    }

    fn spawn_error(&self, reason: String) -> SupervisorError {
        SupervisorError::ProcessSpawn {
            worker: self.name.clone(),
            reason,
        }
    }

    /// Body of `stop`. Requires `op_lock`.
    async fn stop_locked(&self) {
        {
            let mut core = self.core.lock();
            if let Some(token) = core.restart_cancel.take() {
                token.cancel();
            }
            if core.session.is_some() {
                core.draining = true;
            }
        }

        let drain_deadline = Instant::now() + self.settings.stop_grace;
        loop {
            let drained = self.drained.notified();
            let outstanding = self.core.lock().pending.len();
            if outstanding == 0 {
                break;
            }
            if tokio::time::timeout_at(drain_deadline, drained).await.is_err() {
                tracing::warn!(
                    worker = %self.name,
                    pending = outstanding,
                    "in-flight commands did not finish within the stop grace period"
                );
                break;
            }
        }

        let session = {
            let mut core = self.core.lock();
            core.draining = false;
            core.generation += 1;
            core.session.take()
        };
        if let Some(session) = session {
            self.terminate_session(session).await;
        }

        let mut core = self.core.lock();
        if let Some(token) = core.restart_cancel.take() {
            token.cancel();
        }
        self.fail_pending(&mut core, |_, _| SupervisorError::ProcessNotRunning {
            worker: self.name.clone(),
            state: ProcessState::Stopped,
        });
        core.running_since = None;
        core.last_seen = None;
        self.transition(&mut core, ProcessState::Stopped);
    }

    async fn terminate_session(&self, session: Session) {
        let Session {
            writer,
            control,
            reader_cancel,
            pid,
            ..
        } = session;

        match protocol::Outbound::Shutdown.encode() {
            Ok(line) => {
                if writer.send(line).is_err() {
                    tracing::debug!(worker = %self.name, "worker input already closed");
                }
            }
            Err(e) => tracing::warn!(worker = %self.name, error = %e, "failed to encode shutdown frame"),
        }
        drop(writer);

        let graceful = control.terminate();
        tracing::debug!(worker = %self.name, worker_pid = ?pid, graceful, "sent termination request");

        match tokio::time::timeout(self.settings.stop_grace, control.wait()).await {
            Ok(exit) => {
                tracing::info!(worker = %self.name, worker_pid = ?pid, exit = %exit, "worker stopped");
            }
            Err(_) => {
                tracing::warn!(worker = %self.name, worker_pid = ?pid, "grace period expired; killing worker");
                control.kill().await;
            }
        }
        reader_cancel.cancel();
    }

    fn handle_line(&self, generation: u64, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let frame = match protocol::decode(line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    worker = %self.name,
                    error = %e,
                    line = %protocol::preview(line),
                    "dropping malformed worker output"
                );
                return;
            }
        };

        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.generation != generation {
            return;
        }
        core.last_seen = Some(Instant::now());
        if core.state == ProcessState::Starting {
            self.mark_ready(core);
        }

        match frame {
            Inbound::Ready(_) | Inbound::Heartbeat => {}
            Inbound::Response { id, outcome } => match core.pending.remove(&id) {
                Some(pending) => {
                    let result = outcome.map_err(|reason| SupervisorError::CommandFailure {
                        id,
                        name: pending.name.clone(),
                        reason,
                    });
                    if pending.tx.send(result).is_err() {
                        tracing::trace!(worker = %self.name, id, "command caller already gone");
                    }
                    if core.pending.is_empty() {
                        self.drained.notify_waiters();
                    }
                }
                None => {
                    tracing::debug!(worker = %self.name, id, "response for unknown or expired command");
                }
            },
            Inbound::Event { name, data } => {
                self.events.publish(Event::new(EventKind::from_name(&name), data));
            }
            Inbound::Telemetry(parts) => {
                for (kind, payload) in parts {
                    self.events.publish(Event::new(kind, payload));
                }
            }
        }
    }

    fn mark_ready(&self, core: &mut Core) {
        core.running_since = Some(Instant::now());
        if let Some(ready) = core.session.as_mut().and_then(|s| s.ready.take()) {
            if ready.send(()).is_err() {
                tracing::debug!(worker = %self.name, "worker became ready after startup was abandoned");
            }
        }
        self.transition(core, ProcessState::Running);
    }

    fn on_exit(self: &Arc<Self>, generation: u64, exit: &WorkerExit) {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.generation != generation {
            tracing::debug!(worker = %self.name, exit = %exit, "ignoring exit of retired worker");
            return;
        }
        core.generation += 1;
        core.session = None;

        let reason = format!("worker exited unexpectedly ({exit})");
        self.fail_pending(core, |id, name| SupervisorError::CommandFailure {
            id,
            name,
            reason: "worker exited".to_owned(),
        });

        match (core.state, core.origin) {
            (ProcessState::Running, _) | (ProcessState::Starting, LaunchOrigin::Restart) => {
                self.handle_crash(core, &reason);
            }
            (ProcessState::Starting, LaunchOrigin::Explicit) => {
                tracing::error!(worker = %self.name, error = %reason, "worker exited during startup");
                core.last_error = Some(reason);
                self.transition(core, ProcessState::Failed);
            }
            (ProcessState::Stopped | ProcessState::Restarting | ProcessState::Failed, _) => {}
        }
    }

    /// Counts a crash and either schedules a restart or gives up.
    fn handle_crash(self: &Arc<Self>, core: &mut Core, reason: &str) {
        let stable = core
            .running_since
            .is_some_and(|since| since.elapsed() >= self.settings.stable_after);
        if stable {
            core.consecutive_crashes = 0;
        }
        core.consecutive_crashes += 1;
        core.running_since = None;
        core.last_error = Some(reason.to_owned());

        if core.consecutive_crashes > self.settings.max_restarts {
            tracing::error!(
                worker = %self.name,
                crashes = core.consecutive_crashes,
                error = %reason,
                "restart budget exhausted; worker failed"
            );
            self.transition(core, ProcessState::Failed);
            return;
        }

        core.restart_count += 1;
        let delay = self.settings.backoff.next(core.consecutive_crashes - 1);
        let cancel = CancellationToken::new();
        core.restart_cancel = Some(cancel.clone());
        let generation = core.generation;
        tracing::warn!(
            worker = %self.name,
            attempt = core.consecutive_crashes,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %reason,
            "worker crashed; restart scheduled"
        );
        self.transition(core, ProcessState::Restarting);

        tokio::spawn(restart_after(Arc::clone(self), generation, delay, cancel));
    }
}

async fn restart_after(
    shared: Arc<Shared>,
    generation: u64,
    delay: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        () = cancel.cancelled() => return,
        () = shared.shutdown.cancelled() => return,
        () = tokio::time::sleep(delay) => {}
    }

    let _op = shared.op_lock.lock().await;
    {
        let mut core = shared.core.lock();
        if cancel.is_cancelled()
            || core.generation != generation
            || core.state != ProcessState::Restarting
        {
            return;
        }
        core.restart_cancel = None;
    }
    if let Err(e) = shared.launch(LaunchOrigin::Restart).await {
        tracing::warn!(worker = %shared.name, error = %e, "restart attempt failed");
    }
}

async fn write_loop(
    worker: String,
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = rx.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::debug!(worker = %worker, error = %e, "worker stdin closed");
            return;
        }
    }
    if let Err(e) = stdin.shutdown().await {
        tracing::trace!(worker = %worker, error = %e, "closing worker stdin");
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    generation: u64,
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            next = lines.next_line() => match next {
                Ok(Some(line)) => shared.handle_line(generation, &line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(worker = %shared.name, error = %e, "worker stdout read error");
                    break;
                }
            },
        }
    }
}

async fn watch_exit(shared: Arc<Shared>, generation: u64, control: Arc<dyn WorkerControl>) {
    let exit = control.wait().await;
    shared.on_exit(generation, &exit);
}

#[async_trait]
impl Service for ProcessSupervisor {
    async fn stop(&self) -> anyhow::Result<()> {
        ProcessSupervisor::stop(self).await;
        Ok(())
    }

    async fn health(&self) -> anyhow::Result<Option<String>> {
        let core = self.shared.core.lock();
        let last_error = core.last_error.as_deref().unwrap_or("unknown error");
        match core.state {
            ProcessState::Running => {
                if let (Some(limit), Some(seen)) = (self.shared.settings.heartbeat_timeout, core.last_seen) {
                    let silent = seen.elapsed();
                    if silent > limit {
                        anyhow::bail!("no output from worker for {}s", silent.as_secs());
                    }
                }
                let pid = core.session.as_ref().and_then(|s| s.pid);
                Ok(Some(match pid {
                    Some(pid) => format!("running (pid {pid})"),
                    None => "running".to_owned(),
                }))
            }
            ProcessState::Starting => Ok(Some("starting".to_owned())),
            ProcessState::Stopped => anyhow::bail!("worker is stopped"),
            ProcessState::Restarting => anyhow::bail!("worker is restarting: {last_error}"),
            ProcessState::Failed => anyhow::bail!("worker failed: {last_error}"),
        }
    }
}

/// Registry descriptor for the monitor worker.
///
/// The factory starts the worker. A worker that fails to start is kept in
/// the registry (visible as `failed`) unless `config.required` is set.
pub fn service_descriptor(
    config: &WorkerConfig,
    launcher: Arc<dyn WorkerLauncher>,
    depends_on: &[&str],
) -> ServiceDescriptor {
    let settings = SupervisorSettings::from(config);
    let required = config.required;
    ServiceDescriptor::new(SERVICE_NAME, depends_on, move |ctx: InitContext| {
        let settings = settings.clone();
        let launcher = Arc::clone(&launcher);
        async move {
            let supervisor = ProcessSupervisor::new(
                SERVICE_NAME,
                settings,
                launcher,
                ctx.events().clone(),
                ctx.cancellation_token().child_token(),
            );
            if let Err(e) = supervisor.start().await {
                if required {
                    return Err(anyhow::Error::new(e).context("required worker failed to start"));
                }
                tracing::warn!(worker = SERVICE_NAME, error = %e, "worker failed to start; continuing without it");
            }
            Ok(Arc::new(supervisor) as Arc<dyn Service>)
        }
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            startup_timeout: Duration::from_secs(1),
            stop_grace: Duration::from_millis(500),
            command_timeout: Duration::from_secs(1),
            heartbeat_timeout: Some(Duration::from_secs(10)),
            backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5)),
            max_restarts: 3,
            stable_after: Duration::from_secs(60),
        }
    }

    fn supervisor(
        launcher: MemoryLauncher,
        settings: SupervisorSettings,
    ) -> (ProcessSupervisor, Arc<MemoryLauncher>, UnboundedReceiver<Event>) {
        let launcher = Arc::new(launcher);
        let (sink, rx) = EventSink::channel();
        let sup = ProcessSupervisor::new(
            "test-worker",
            settings,
            Arc::clone(&launcher) as Arc<dyn WorkerLauncher>,
            sink,
            CancellationToken::new(),
        );
        (sup, launcher, rx)
    }

    fn states(rx: &mut UnboundedReceiver<Event>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if ev.kind() == &EventKind::Status {
                out.push(ev.payload()["state"].as_str().unwrap().to_owned());
            }
        }
        out
    }

    #[tokio::test]
    async fn start_waits_for_first_frame() {
        let (launcher, mut workers) = MemoryLauncher::new();
        let (sup, _, mut events) = supervisor(launcher, settings());

        let starter = sup.clone();
        let start = tokio::spawn(async move { starter.start().await });
        let mut worker = workers.next().await.unwrap();
        assert_eq!(sup.state(), ProcessState::Starting);

        // A telemetry bundle counts as readiness and is republished.
        worker.send(&json!({ "metrics": [{ "name": "cpu", "value": 3 }] })).await.unwrap();
        start.await.unwrap().unwrap();

        assert_eq!(sup.state(), ProcessState::Running);
        let status = sup.get_status();
        assert_eq!(status.pid, Some(worker.pid()));
        assert_eq!(status.instance_id, Some(worker.instance_id()));

        let mut kinds = Vec::new();
        while let Ok(ev) = events.try_recv() {
            kinds.push(ev.kind().as_str().to_owned());
        }
        assert_eq!(kinds, vec!["status", "status", "metrics"]);
    }

    #[tokio::test]
    async fn start_is_a_noop_while_running() {
        let (launcher, _workers) = MemoryLauncher::new();
        let (sup, launcher, _events) = supervisor(launcher.auto_ready(), settings());
        sup.start().await.unwrap();
        sup.start().await.unwrap();
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_deadline_fails_the_worker() {
        let (launcher, mut workers) = MemoryLauncher::new();
        let (sup, _, mut events) = supervisor(launcher, settings());

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::ProcessSpawn { .. }));
        assert_eq!(sup.state(), ProcessState::Failed);
        assert!(workers.next().await.unwrap().has_exited());
        assert_eq!(states(&mut events), vec!["starting", "failed"]);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let (launcher, _workers) = MemoryLauncher::new();
        launcher.fail_next(1);
        let (sup, _, _events) = supervisor(launcher, settings());

        let err = sup.start().await.unwrap_err();
        match err {
            SupervisorError::ProcessSpawn { reason, .. } => assert!(reason.contains("refused")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sup.get_status().state, ProcessState::Failed);
        assert!(sup.get_status().last_error.is_some());
    }

    #[tokio::test]
    async fn commands_require_running_worker() {
        let (launcher, _workers) = MemoryLauncher::new();
        let (sup, _, _events) = supervisor(launcher, settings());
        let err = sup.send_command("scan", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            SupervisorError::ProcessNotRunning {
                worker: "test-worker".to_owned(),
                state: ProcessState::Stopped
            }
        );
    }

    #[tokio::test]
    async fn responses_are_correlated_by_id() {
        let (launcher, mut workers) = MemoryLauncher::new();
        let (sup, _, _events) = supervisor(launcher.auto_ready(), settings());
        sup.start().await.unwrap();
        let mut worker = workers.next().await.unwrap();

        let a = tokio::spawn({
            let sup = sup.clone();
            async move { sup.send_command("first", json!({ "n": 1 })).await }
        });
        let first = worker.recv().await.unwrap();
        let b = tokio::spawn({
            let sup = sup.clone();
            async move { sup.send_command("second", json!({ "n": 2 })).await }
        });
        let second = worker.recv().await.unwrap();
        assert_eq!(first["name"], "first");
        assert_eq!(second["name"], "second");
        assert!(first["id"].as_u64().unwrap() < second["id"].as_u64().unwrap());

        // Answer out of order.
        worker
            .send(&json!({ "type": "response", "id": second["id"], "ok": false, "error": "nope" }))
            .await
            .unwrap();
        worker
            .send(&json!({ "type": "response", "id": first["id"], "ok": true, "result": "done" }))
            .await
            .unwrap();

        assert_eq!(a.await.unwrap().unwrap(), json!("done"));
        match b.await.unwrap().unwrap_err() {
            SupervisorError::CommandFailure { name, reason, .. } => {
                assert_eq!(name, "second");
                assert_eq!(reason, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sup.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_while_running_restarts_with_backoff() {
        let (launcher, mut workers) = MemoryLauncher::new();
        let (sup, launcher, mut events) = supervisor(launcher.auto_ready(), settings());
        sup.start().await.unwrap();
        let first = workers.next().await.unwrap();
        let mut state = sup.watch_state();

        let begun = Instant::now();
        first.exit(1);
        state.wait_for(|s| *s == ProcessState::Restarting).await.unwrap();
        state.wait_for(|s| *s == ProcessState::Running).await.unwrap();
        assert!(begun.elapsed() >= Duration::from_millis(100));

        let status = sup.get_status();
        assert_eq!(status.restart_count, 1);
        assert_eq!(status.consecutive_crashes, 1);
        assert!(status.last_error.unwrap().contains("exit code 1"));
        assert_eq!(launcher.launches(), 2);
        assert_eq!(
            states(&mut events),
            vec!["starting", "running", "restarting", "starting", "running"]
        );
    }

    #[tokio::test]
    async fn exit_fails_pending_commands() {
        let (launcher, mut workers) = MemoryLauncher::new();
        let (sup, _, _events) = supervisor(launcher.auto_ready(), settings());
        sup.start().await.unwrap();
        let mut worker = workers.next().await.unwrap();

        let call = tokio::spawn({
            let sup = sup.clone();
            async move { sup.send_command("slow", json!(null)).await }
        });
        worker.recv().await.unwrap();
        worker.exit(9);

        match call.await.unwrap().unwrap_err() {
            SupervisorError::CommandFailure { reason, .. } => assert_eq!(reason, "worker exited"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sup.pending_count(), 0);
    }

    #[tokio::test]
    async fn stop_sends_shutdown_and_ends_stopped() {
        let (launcher, mut workers) = MemoryLauncher::new();
        let (sup, _, mut events) = supervisor(launcher.auto_ready(), settings());
        sup.start().await.unwrap();
        let mut worker = workers.next().await.unwrap();

        sup.stop().await;
        assert_eq!(sup.state(), ProcessState::Stopped);
        assert!(worker.was_terminated());
        assert_eq!(worker.recv().await.unwrap()["type"], "shutdown");
        assert_eq!(states(&mut events), vec!["starting", "running", "stopped"]);

        // Already stopped: nothing changes.
        sup.stop().await;
        assert_eq!(sup.state(), ProcessState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_kills_a_worker_that_ignores_termination() {
        let (launcher, mut workers) = MemoryLauncher::new();
        let (sup, _, _events) = supervisor(launcher.auto_ready().ignore_terminate(), settings());
        sup.start().await.unwrap();
        let worker = workers.next().await.unwrap();

        sup.stop().await;
        assert!(worker.was_terminated());
        assert!(worker.has_exited());
        assert_eq!(sup.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn stop_drains_in_flight_commands() {
        let (launcher, mut workers) = MemoryLauncher::new();
        let (sup, _, _events) = supervisor(launcher.auto_ready(), settings());
        sup.start().await.unwrap();
        let mut worker = workers.next().await.unwrap();

        let call = tokio::spawn({
            let sup = sup.clone();
            async move { sup.send_command("flush", json!({})).await }
        });
        let frame = worker.recv().await.unwrap();

        let stopper = tokio::spawn({
            let sup = sup.clone();
            async move { sup.stop().await }
        });
        tokio::task::yield_now().await;
        // New commands are refused while draining.
        assert!(matches!(
            sup.send_command("late", json!({})).await,
            Err(SupervisorError::ProcessNotRunning { .. })
        ));

        worker
            .send(&json!({ "type": "response", "id": frame["id"], "ok": true, "result": 1 }))
            .await
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!(1));
        stopper.await.unwrap();
        assert_eq!(sup.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn malformed_output_is_dropped() {
        let (launcher, mut workers) = MemoryLauncher::new();
        let (sup, _, mut events) = supervisor(launcher.auto_ready(), settings());
        sup.start().await.unwrap();
        let mut worker = workers.next().await.unwrap();

        worker.send_line("Collected metrics: [1, 2]").await.unwrap();
        worker.send_line("{\"type\":\"mystery\"}").await.unwrap();
        worker
            .send(&json!({ "type": "event", "event": "scanFinished", "data": { "files": 2 } }))
            .await
            .unwrap();

        let mut custom = None;
        while custom.is_none() {
            let ev = events.recv().await.unwrap();
            if ev.kind() != &EventKind::Status {
                custom = Some(ev);
            }
        }
        let ev = custom.unwrap();
        assert_eq!(ev.kind().as_str(), "scanFinished");
        assert_eq!(ev.payload()["files"], 2);
        assert_eq!(sup.state(), ProcessState::Running);
    }

    #[tokio::test]
    async fn health_follows_state() {
        let (launcher, _workers) = MemoryLauncher::new();
        let (sup, _, _events) = supervisor(launcher.auto_ready(), settings());
        assert!(Service::health(&sup).await.is_err());

        sup.start().await.unwrap();
        let detail = Service::health(&sup).await.unwrap().unwrap();
        assert!(detail.starts_with("running"));

        sup.stop().await;
        assert!(Service::health(&sup).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_worker_is_unhealthy() {
        let (launcher, _workers) = MemoryLauncher::new();
        let (sup, _, _events) = supervisor(launcher.auto_ready(), settings());
        sup.start().await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let err = Service::health(&sup).await.unwrap_err();
        assert!(err.to_string().contains("no output"));
    }
}
