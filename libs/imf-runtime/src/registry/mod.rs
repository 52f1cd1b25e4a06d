//! Service registry: ordered startup, typed lookup, health aggregation and
//! reverse-order shutdown for the services that make up the application.

mod builder;
mod error;

pub use builder::{DEFAULT_PROBE_TIMEOUT, RegistryBuilder};
pub use error::RegistryError;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::contracts::{AsAnyArc, FnFactory, Service, ServiceFactory};
use crate::events::{EventBroadcaster, EventSink};

/// A named service together with its declared dependencies and factory.
///
/// Descriptors are immutable once created.
#[derive(Clone)]
pub struct ServiceDescriptor {
    name: String,
    depends_on: Vec<String>,
    factory: Arc<dyn ServiceFactory>,
}

impl ServiceDescriptor {
    pub fn new<F, Fut>(name: impl Into<String>, depends_on: &[&str], factory: F) -> Self
    where
        F: Fn(InitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<dyn Service>>> + Send + 'static,
    {
        Self::with_factory(name, depends_on, Arc::new(FnFactory(factory)))
    }

    pub fn with_factory(
        name: impl Into<String>,
        depends_on: &[&str],
        factory: Arc<dyn ServiceFactory>,
    ) -> Self {
        let mut deps: Vec<String> = Vec::with_capacity(depends_on.len());
        for dep in depends_on {
            if !deps.iter().any(|d| d == dep) {
                deps.push((*dep).to_owned());
            }
        }
        Self {
            name: name.into(),
            depends_on: deps,
            factory,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// A started service instance.
#[derive(Clone)]
pub struct ServiceHandle {
    name: Arc<str>,
    service: Arc<dyn Service>,
}

impl ServiceHandle {
    pub fn new(name: &str, service: Arc<dyn Service>) -> Self {
        Self {
            name: Arc::from(name),
            service,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    /// Returns the concrete service if it is a `T`.
    pub fn downcast<T: Service>(&self) -> Option<Arc<T>> {
        AsAnyArc::as_any_arc(Arc::clone(&self.service))
            .downcast::<T>()
            .ok()
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Process-wide resources handed to every factory.
#[derive(Clone)]
pub struct SharedResources {
    pub events: EventSink,
    pub broadcaster: EventBroadcaster,
    pub cancel: CancellationToken,
}

impl SharedResources {
    pub fn new(events: EventSink, broadcaster: EventBroadcaster, cancel: CancellationToken) -> Self {
        Self {
            events,
            broadcaster,
            cancel,
        }
    }

    /// Resources not connected to anything: events go nowhere.
    pub fn detached() -> Self {
        Self::new(
            EventSink::noop(),
            EventBroadcaster::default(),
            CancellationToken::new(),
        )
    }
}

/// What a factory sees while its service is being built.
///
/// Only the declared dependencies are visible, all of them already started.
#[derive(Clone)]
pub struct InitContext {
    service: Arc<str>,
    deps: Arc<HashMap<String, ServiceHandle>>,
    shared: SharedResources,
}

impl InitContext {
    fn new(service: &str, deps: HashMap<String, ServiceHandle>, shared: SharedResources) -> Self {
        Self {
            service: Arc::from(service),
            deps: Arc::new(deps),
            shared,
        }
    }

    /// Name of the service being built.
    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn dependency(&self, name: &str) -> Result<&ServiceHandle, RegistryError> {
        self.deps
            .get(name)
            .ok_or_else(|| RegistryError::ServiceNotFound {
                name: name.to_owned(),
            })
    }

    pub fn get<T: Service>(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        let handle = self.dependency(name)?;
        handle
            .downcast::<T>()
            .ok_or_else(|| RegistryError::TypeMismatch {
                name: name.to_owned(),
                expected: std::any::type_name::<T>(),
            })
    }

    pub fn events(&self) -> &EventSink {
        &self.shared.events
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.shared.broadcaster
    }

    /// Cancelled when the application starts shutting down.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }
}

/// Health of one service at the time it was probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthStatus {
    pub name: String,
    pub healthy: bool,
    pub last_checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of [`ServiceRegistry::shutdown`], in stop order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
    pub abandoned: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.abandoned.is_empty()
    }
}

/// The resolved, immutable set of descriptors plus the services started from
/// them.
pub struct ServiceRegistry {
    descriptors: Vec<ServiceDescriptor>,
    probe_timeout: Duration,
    initialized: AtomicBool,
    started: Mutex<Vec<ServiceHandle>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("start_order", &self.start_order())
            .field("probe_timeout", &self.probe_timeout)
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub(crate) fn from_sorted(descriptors: Vec<ServiceDescriptor>, probe_timeout: Duration) -> Self {
        Self {
            descriptors,
            probe_timeout,
            initialized: AtomicBool::new(false),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Service names in the order they are started.
    pub fn start_order(&self) -> Vec<&str> {
        self.descriptors.iter().map(ServiceDescriptor::name).collect()
    }

    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.descriptors
    }

    /// Running services in start order.
    pub fn started(&self) -> Vec<ServiceHandle> {
        self.started.lock().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Builds every service in start order, awaiting each factory.
    ///
    /// If a factory fails, the services already started are stopped in
    /// reverse order and the registry can be initialized again.
    pub async fn initialize(&self, shared: &SharedResources) -> Result<(), RegistryError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(RegistryError::AlreadyInitialized);
        }

        let mut live: HashMap<String, ServiceHandle> = HashMap::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            let deps = descriptor
                .depends_on()
                .iter()
                .filter_map(|dep| live.get(dep).map(|h| (dep.clone(), h.clone())))
                .collect();
            let ctx = InitContext::new(descriptor.name(), deps, shared.clone());

            tracing::debug!(service = %descriptor.name(), "initializing service");
            match descriptor.factory.create(ctx).await {
                Ok(service) => {
                    let handle = ServiceHandle::new(descriptor.name(), service);
                    live.insert(descriptor.name().to_owned(), handle.clone());
                    self.started.lock().push(handle);
                    tracing::info!(service = %descriptor.name(), "service started");
                }
                Err(source) => {
                    tracing::error!(
                        service = %descriptor.name(),
                        error = %format!("{source:#}"),
                        "service initialization failed; stopping started services"
                    );
                    let started = std::mem::take(&mut *self.started.lock());
                    stop_in_reverse(started, None).await;
                    self.initialized.store(false, Ordering::Release);
                    return Err(RegistryError::Initialization {
                        service: descriptor.name().to_owned(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get_service(&self, name: &str) -> Result<ServiceHandle, RegistryError> {
        self.started
            .lock()
            .iter()
            .find(|h| h.name() == name)
            .cloned()
            .ok_or_else(|| RegistryError::ServiceNotFound {
                name: name.to_owned(),
            })
    }

    pub fn get<T: Service>(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        self.get_service(name)?
            .downcast::<T>()
            .ok_or_else(|| RegistryError::TypeMismatch {
                name: name.to_owned(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Optional lookup: `None` means the feature is disabled.
    pub fn find<T: Service>(&self, name: &str) -> Option<Arc<T>> {
        self.get_service(name).ok()?.downcast::<T>()
    }

    /// Probes every running service concurrently. Never fails: errors and
    /// probe timeouts are reported as unhealthy.
    pub async fn get_health_status(&self) -> Vec<ServiceHealthStatus> {
        let services = self.started();
        let timeout = self.probe_timeout;
        let probes = services.iter().map(|handle| async move {
            let outcome = tokio::time::timeout(timeout, handle.service().health()).await;
            let (healthy, detail) = match outcome {
                Ok(Ok(detail)) => (true, detail),
                Ok(Err(e)) => (false, Some(format!("{e:#}"))),
                Err(_) => (
                    false,
                    Some(format!("health probe timed out after {}ms", timeout.as_millis())),
                ),
            };
            ServiceHealthStatus {
                name: handle.name().to_owned(),
                healthy,
                last_checked_at: Utc::now(),
                detail,
            }
        });
        join_all(probes).await
    }

    /// Stops running services in reverse start order within `timeout`.
    ///
    /// A failing stop is logged and does not prevent the next one. Services
    /// still stopping at the deadline are abandoned. Calling this again stops
    /// nothing.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let started = std::mem::take(&mut *self.started.lock());
        if started.is_empty() {
            return ShutdownReport::default();
        }
        let report = stop_in_reverse(started, Some(Instant::now() + timeout)).await;
        if !report.is_clean() {
            tracing::warn!(
                failed = ?report.failed,
                abandoned = ?report.abandoned,
                "registry shutdown finished with errors"
            );
        }
        report
    }
}

async fn stop_in_reverse(started: Vec<ServiceHandle>, deadline: Option<Instant>) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    for handle in started.into_iter().rev() {
        let name = handle.name().to_owned();
        tracing::debug!(service = %name, "stopping service");

        let result = match deadline {
            // An expired deadline still polls the stop future once.
            Some(deadline) => tokio::time::timeout_at(deadline, handle.service().stop()).await,
            None => Ok(handle.service().stop().await),
        };
        match result {
            Ok(Ok(())) => {
                tracing::info!(service = %name, "service stopped");
                report.stopped.push(name);
            }
            Ok(Err(e)) => {
                tracing::warn!(service = %name, error = %format!("{e:#}"), "service stop failed; continuing");
                report.failed.push(name);
            }
            Err(_) => {
                tracing::warn!(service = %name, "service did not stop before the shutdown deadline; abandoned");
                report.abandoned.push(name);
            }
        }
    }
    report
}
