use std::sync::Arc;

use imf_runtime::supervisor::{self, WorkerLauncher};
use imf_runtime::{
    ApplicationOrchestrator, EventBroadcaster, OrchestratorSettings, RegistryError,
    RuntimeConfig, ServiceRegistry,
};

use crate::telemetry_store;

/// Registers the hosted services.
///
/// The snapshot store comes first so it is subscribed before the worker
/// publishes its first status event.
pub fn build_registry(
    cfg: &RuntimeConfig,
    launcher: Arc<dyn WorkerLauncher>,
) -> Result<ServiceRegistry, RegistryError> {
    let mut builder = ServiceRegistry::builder().probe_timeout(cfg.health.probe_timeout());
    builder.register(telemetry_store::descriptor())?;
    if cfg.worker.enabled {
        builder.register(supervisor::service_descriptor(
            &cfg.worker,
            launcher,
            &[telemetry_store::SERVICE_NAME],
        ))?;
    } else {
        tracing::info!(service = supervisor::SERVICE_NAME, "worker disabled by configuration");
    }
    builder.build()
}

pub fn build_orchestrator(
    cfg: &RuntimeConfig,
    launcher: Arc<dyn WorkerLauncher>,
) -> Result<ApplicationOrchestrator, RegistryError> {
    let registry = build_registry(cfg, launcher)?;
    Ok(ApplicationOrchestrator::new(
        registry,
        EventBroadcaster::new(cfg.broadcast.queue_capacity),
        OrchestratorSettings::from(cfg),
    ))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use imf_runtime::supervisor::{MemoryLauncher, ProcessState};
    use std::time::Duration;

    use crate::telemetry_store::TelemetryStore;

    #[tokio::test]
    async fn store_sees_the_worker_come_up() {
        let (launcher, _workers) = MemoryLauncher::new();
        let cfg = RuntimeConfig::default();
        let orch = build_orchestrator(&cfg, Arc::new(launcher.auto_ready())).unwrap();
        assert_eq!(
            orch.registry().start_order(),
            vec![telemetry_store::SERVICE_NAME, supervisor::SERVICE_NAME]
        );

        orch.initialize().await.unwrap();
        let store = orch
            .registry()
            .get::<TelemetryStore>(telemetry_store::SERVICE_NAME)
            .unwrap();
        let running = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let running = store
                    .latest("status")
                    .filter(|s| s.data["state"] == ProcessState::Running.as_str());
                if let Some(status) = running {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(running.data["worker"], supervisor::SERVICE_NAME);

        assert!(orch.shutdown().await.is_clean());
    }

    #[tokio::test]
    async fn disabled_worker_is_not_registered() {
        let (launcher, _workers) = MemoryLauncher::new();
        let mut cfg = RuntimeConfig::default();
        cfg.worker.enabled = false;
        let registry = build_registry(&cfg, Arc::new(launcher)).unwrap();
        assert_eq!(registry.start_order(), vec![telemetry_store::SERVICE_NAME]);
    }
}
