//! Application lifecycle: registry startup, event wiring, health polling and
//! the single shutdown path.
//!
//! ```text
//! Uninitialized ──initialize()──► Initializing ──ok──► Running ──shutdown()──► ShuttingDown ──► Stopped
//!       ▲                              │
//!       └──────────── error ───────────┘
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::events::{Event, EventBroadcaster, EventSink};
use crate::registry::{RegistryError, ServiceHealthStatus, ServiceRegistry, SharedResources, ShutdownReport};

/// Application-level event type published when a service changes health.
pub const HEALTH_EVENT: &str = "health";

/// Upper bound on waiting for the event bridge to drain at shutdown.
const BRIDGE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound on waiting for subscriber queues to empty before they close.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(250);
const FLUSH_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl OrchestratorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("cannot {operation} while the orchestrator is {state}")]
    InvalidState {
        operation: &'static str,
        state: OrchestratorState,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub health_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for OrchestratorSettings {
    fn from(cfg: &RuntimeConfig) -> Self {
        Self {
            health_interval: cfg.health.interval(),
            shutdown_timeout: cfg.shutdown.timeout(),
        }
    }
}

/// One completed health poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub checked_at: DateTime<Utc>,
    pub services: Vec<ServiceHealthStatus>,
}

impl HealthSnapshot {
    pub fn all_healthy(&self) -> bool {
        self.services.iter().all(|s| s.healthy)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub state: OrchestratorState,
    /// Running services in start order.
    pub services: Vec<String>,
    pub last_health: Option<HealthSnapshot>,
    pub subscribers: usize,
    pub dropped_events: u64,
}

/// Health polling with overlap suppression.
struct HealthMonitor {
    in_flight: AtomicBool,
    last: Mutex<Option<HealthSnapshot>>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HealthMonitor {
    fn new() -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            last: Mutex::new(None),
        }
    }

    /// Runs one poll, or returns `None` if another is outstanding.
    async fn poll(&self, registry: &ServiceRegistry, broadcaster: &EventBroadcaster) -> Option<HealthSnapshot> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return None;
        }
        let _guard = InFlight(&self.in_flight);

        let services = registry.get_health_status().await;
        let snapshot = HealthSnapshot {
            checked_at: Utc::now(),
            services,
        };

        let previous: HashMap<String, bool> = self
            .last
            .lock()
            .as_ref()
            .map(|s| s.services.iter().map(|h| (h.name.clone(), h.healthy)).collect())
            .unwrap_or_default();

        for status in &snapshot.services {
            if !status.healthy {
                tracing::warn!(
                    service = %status.name,
                    detail = status.detail.as_deref().unwrap_or(""),
                    "service unhealthy"
                );
            }
            // A service seen for the first time is assumed to have been healthy.
            let was_healthy = previous.get(&status.name).copied().unwrap_or(true);
            if was_healthy != status.healthy {
                broadcaster.publish(Event::new(
                    HEALTH_EVENT,
                    json!({
                        "service": status.name,
                        "healthy": status.healthy,
                        "detail": status.detail,
                    }),
                ));
            }
        }

        *self.last.lock() = Some(snapshot.clone());
        Some(snapshot)
    }

    fn last(&self) -> Option<HealthSnapshot> {
        self.last.lock().clone()
    }
}

/// Background tasks owned by a running orchestrator.
#[derive(Default)]
struct Tasks {
    services_cancel: Option<CancellationToken>,
    health: Option<JoinHandle<()>>,
    bridge_stop: Option<CancellationToken>,
    bridge: Option<JoinHandle<()>>,
}

/// Owns the registry and the broadcaster for the life of the application.
pub struct ApplicationOrchestrator {
    registry: Arc<ServiceRegistry>,
    broadcaster: EventBroadcaster,
    settings: OrchestratorSettings,
    state_tx: watch::Sender<OrchestratorState>,
    tasks: Mutex<Tasks>,
    health: Arc<HealthMonitor>,
    shutdown_lock: tokio::sync::Mutex<Option<ShutdownReport>>,
}

impl ApplicationOrchestrator {
    pub fn new(registry: ServiceRegistry, broadcaster: EventBroadcaster, settings: OrchestratorSettings) -> Self {
        Self {
            registry: Arc::new(registry),
            broadcaster,
            settings,
            state_tx: watch::Sender::new(OrchestratorState::Uninitialized),
            tasks: Mutex::new(Tasks::default()),
            health: Arc::new(HealthMonitor::new()),
            shutdown_lock: tokio::sync::Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state_tx.subscribe()
    }

    /// Moves `from` to `to`; fails with the current state otherwise.
    fn advance(&self, from: OrchestratorState, to: OrchestratorState) -> Result<(), OrchestratorState> {
        let mut current = from;
        let moved = self.state_tx.send_if_modified(|state| {
            current = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(from = %from, to = %to, "orchestrator state changed");
            Ok(())
        } else {
            Err(current)
        }
    }

    /// Starts every registered service, connects their events to the
    /// broadcaster and starts the health timer.
    ///
    /// On failure the started services have been stopped again and the
    /// orchestrator is back to `Uninitialized`.
    pub async fn initialize(&self) -> Result<(), OrchestratorError> {
        self.advance(OrchestratorState::Uninitialized, OrchestratorState::Initializing)
            .map_err(|state| OrchestratorError::InvalidState {
                operation: "initialize",
                state,
            })?;
        let started_at = Instant::now();

        let (sink, rx) = EventSink::channel();
        let bridge_stop = CancellationToken::new();
        let bridge = tokio::spawn(bridge_events(rx, self.broadcaster.clone(), bridge_stop.clone()));
        let services_cancel = CancellationToken::new();
        let shared = SharedResources::new(sink, self.broadcaster.clone(), services_cancel.clone());

        if let Err(e) = self.registry.initialize(&shared).await {
            tracing::error!(error = %e, "initialization failed");
            drop(shared);
            services_cancel.cancel();
            bridge_stop.cancel();
            if bridge.await.is_err() {
                tracing::warn!("event bridge task panicked");
            }
            self.state_tx.send_replace(OrchestratorState::Uninitialized);
            return Err(e.into());
        }

        let health = tokio::spawn(health_loop(
            Arc::clone(&self.health),
            Arc::clone(&self.registry),
            self.broadcaster.clone(),
            self.settings.health_interval,
            services_cancel.clone(),
        ));

        *self.tasks.lock() = Tasks {
            services_cancel: Some(services_cancel),
            health: Some(health),
            bridge_stop: Some(bridge_stop),
            bridge: Some(bridge),
        };
        self.state_tx.send_replace(OrchestratorState::Running);
        tracing::info!(
            services = ?self.registry.start_order(),
            elapsed_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "orchestrator running"
        );
        Ok(())
    }

    /// Stops the health timer, shuts the registry down in reverse start order,
    /// flushes pending events to subscribers and then closes them.
    ///
    /// Idempotent: later and concurrent calls wait for the first one and
    /// return its report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut done = self.shutdown_lock.lock().await;
        if let Some(report) = done.as_ref() {
            return report.clone();
        }

        let mut state = self.watch_state();
        let settled = state
            .wait_for(|s| *s != OrchestratorState::Initializing)
            .await
            .map(|s| *s)
            .unwrap_or(OrchestratorState::Uninitialized);
        if settled != OrchestratorState::Running {
            self.state_tx.send_replace(OrchestratorState::Stopped);
            let report = ShutdownReport::default();
            *done = Some(report.clone());
            return report;
        }

        self.state_tx.send_replace(OrchestratorState::ShuttingDown);
        tracing::info!("orchestrator shutting down");
        let tasks = std::mem::take(&mut *self.tasks.lock());

        if let Some(token) = &tasks.services_cancel {
            token.cancel();
        }
        if let Some(health) = tasks.health {
            health.abort();
            if let Err(e) = health.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "health task failed");
                }
            }
        }

        let report = self.registry.shutdown(self.settings.shutdown_timeout).await;

        if let Some(stop) = tasks.bridge_stop {
            stop.cancel();
        }
        if let Some(bridge) = tasks.bridge {
            match tokio::time::timeout(BRIDGE_DRAIN_TIMEOUT, bridge).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "event bridge task failed"),
                Err(_) => tracing::warn!("event bridge did not drain in time"),
            }
        }
        self.flush_subscribers().await;
        self.broadcaster.close_all();

        self.state_tx.send_replace(OrchestratorState::Stopped);
        tracing::info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            abandoned = report.abandoned.len(),
            "orchestrator stopped"
        );
        *done = Some(report.clone());
        report
    }

    async fn flush_subscribers(&self) {
        let deadline = Instant::now() + FLUSH_TIMEOUT;
        while self.broadcaster.stats().iter().any(|s| s.queued > 0) {
            if Instant::now() >= deadline {
                tracing::debug!("subscriber queues not empty at close");
                return;
            }
            tokio::time::sleep(FLUSH_POLL).await;
        }
    }

    /// Awaits `signal`, then shuts down once.
    pub async fn run_until_shutdown<F>(&self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.shutdown().await
    }

    /// Runs one health poll now. `None` if a poll is already outstanding.
    pub async fn check_health(&self) -> Option<HealthSnapshot> {
        self.health.poll(&self.registry, &self.broadcaster).await
    }

    pub fn last_health(&self) -> Option<HealthSnapshot> {
        self.health.last()
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            state: self.state(),
            services: self
                .registry
                .started()
                .iter()
                .map(|h| h.name().to_owned())
                .collect(),
            last_health: self.health.last(),
            subscribers: self.broadcaster.subscriber_count(),
            dropped_events: self.broadcaster.dropped_events(),
        }
    }
}

/// Forwards events from services to the broadcaster until stopped, then
/// forwards whatever is still queued.
async fn bridge_events(
    mut rx: mpsc::UnboundedReceiver<Event>,
    broadcaster: EventBroadcaster,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            next = rx.recv() => match next {
                Some(event) => {
                    broadcaster.publish(event);
                }
                None => break,
            },

            () = stop.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    broadcaster.publish(event);
                }
                break;
            }
        }
    }
    tracing::debug!("event bridge stopped");
}

async fn health_loop(
    monitor: Arc<HealthMonitor>,
    registry: Arc<ServiceRegistry>,
    broadcaster: EventBroadcaster,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if monitor.poll(&registry, &broadcaster).await.is_none() {
                    tracing::debug!("health poll skipped; previous poll still running");
                }
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::contracts::Service;
    use crate::events::{ChannelTransport, EventKind};
    use crate::registry::{InitContext, ServiceDescriptor};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Probe {
        healthy: Arc<AtomicBool>,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Service for Probe {
        async fn stop(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn health(&self) -> anyhow::Result<Option<String>> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(None)
            } else {
                anyhow::bail!("probe says no")
            }
        }
    }

    fn probe(name: &str, healthy: &Arc<AtomicBool>, stops: &Arc<AtomicUsize>) -> ServiceDescriptor {
        let healthy = Arc::clone(healthy);
        let stops = Arc::clone(stops);
        ServiceDescriptor::new(name, &[], move |ctx: InitContext| {
            let service = Probe {
                healthy: Arc::clone(&healthy),
                stops: Arc::clone(&stops),
            };
            async move {
                ctx.events().publish(Event::status(json!({ "service": ctx.service_name() })));
                Ok(Arc::new(service) as Arc<dyn Service>)
            }
        })
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            health_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn initialize_then_shutdown_once() {
        let healthy = Arc::new(AtomicBool::new(true));
        let stops = Arc::new(AtomicUsize::new(0));
        let registry = ServiceRegistry::builder()
            .with(probe("a", &healthy, &stops))
            .unwrap()
            .build()
            .unwrap();
        let orch = ApplicationOrchestrator::new(registry, EventBroadcaster::default(), settings());

        orch.initialize().await.unwrap();
        assert_eq!(orch.state(), OrchestratorState::Running);
        assert_eq!(orch.status().services, vec!["a"]);
        assert!(matches!(
            orch.initialize().await,
            Err(OrchestratorError::InvalidState {
                state: OrchestratorState::Running,
                ..
            })
        ));

        let first = orch.shutdown().await;
        let second = orch.shutdown().await;
        assert_eq!(first.stopped, vec!["a"]);
        assert_eq!(first, second);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(orch.state(), OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn failed_initialize_returns_to_uninitialized() {
        let healthy = Arc::new(AtomicBool::new(true));
        let stops = Arc::new(AtomicUsize::new(0));
        let registry = ServiceRegistry::builder()
            .with(probe("a", &healthy, &stops))
            .unwrap()
            .with(ServiceDescriptor::new("b", &["a"], |_ctx: InitContext| async {
                Err::<Arc<dyn Service>, _>(anyhow::anyhow!("no disk"))
            }))
            .unwrap()
            .build()
            .unwrap();
        let orch = ApplicationOrchestrator::new(registry, EventBroadcaster::default(), settings());

        let err = orch.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Registry(RegistryError::Initialization { ref service, .. }) if service == "b"
        ));
        assert_eq!(orch.state(), OrchestratorState::Uninitialized);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_before_initialize_just_stops() {
        let orch = ApplicationOrchestrator::new(
            ServiceRegistry::builder().build().unwrap(),
            EventBroadcaster::default(),
            settings(),
        );
        let report = orch.shutdown().await;
        assert!(report.stopped.is_empty());
        assert_eq!(orch.state(), OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn service_events_reach_subscribers() {
        let healthy = Arc::new(AtomicBool::new(true));
        let stops = Arc::new(AtomicUsize::new(0));
        let registry = ServiceRegistry::builder()
            .with(probe("a", &healthy, &stops))
            .unwrap()
            .build()
            .unwrap();
        let broadcaster = EventBroadcaster::default();
        let (transport, mut rx) = ChannelTransport::pair(8);
        let _sub = broadcaster.subscribe(Arc::new(transport));
        let orch = ApplicationOrchestrator::new(registry, broadcaster, settings());

        orch.initialize().await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind(), &EventKind::Status);
        assert_eq!(ev.payload()["service"], "a");
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn health_changes_publish_events() {
        let healthy = Arc::new(AtomicBool::new(true));
        let stops = Arc::new(AtomicUsize::new(0));
        let registry = ServiceRegistry::builder()
            .with(probe("a", &healthy, &stops))
            .unwrap()
            .build()
            .unwrap();
        let broadcaster = EventBroadcaster::default();
        let (transport, mut rx) = ChannelTransport::pair(8);
        let _sub = broadcaster.subscribe(Arc::new(transport));
        let orch = ApplicationOrchestrator::new(registry, broadcaster, settings());
        orch.initialize().await.unwrap();
        rx.recv().await.unwrap();

        assert!(orch.check_health().await.unwrap().all_healthy());
        healthy.store(false, Ordering::SeqCst);
        let snapshot = orch.check_health().await.unwrap();
        assert!(!snapshot.all_healthy());
        assert_eq!(snapshot.services[0].detail.as_deref(), Some("probe says no"));

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind().as_str(), HEALTH_EVENT);
        assert_eq!(ev.payload()["healthy"], false);
        assert!(orch.last_health().is_some());
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn health_timer_polls_on_interval() {
        let healthy = Arc::new(AtomicBool::new(false));
        let stops = Arc::new(AtomicUsize::new(0));
        let registry = ServiceRegistry::builder()
            .with(probe("a", &healthy, &stops))
            .unwrap()
            .build()
            .unwrap();
        let orch = ApplicationOrchestrator::new(registry, EventBroadcaster::default(), settings());
        orch.initialize().await.unwrap();
        assert!(orch.last_health().is_none());

        tokio::time::sleep(Duration::from_secs(31)).await;
        let last = orch.last_health().unwrap();
        assert!(!last.all_healthy());
        orch.shutdown().await;
    }
}
