#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! IMF runtime - orchestration core of the monitoring dashboard.
//!
//! The crate owns four cooperating pieces:
//!
//! - [`registry`]: named services with declared dependencies, started in
//!   topological order and stopped in reverse.
//! - [`supervisor`]: the [`ProcessSupervisor`] that owns the external monitor
//!   worker, correlates commands with responses and restarts the worker with
//!   exponential backoff after a crash.
//! - [`events`]: the [`EventBroadcaster`] that fans every published [`Event`]
//!   out to independent, bounded per-subscriber queues.
//! - [`orchestrator`]: the [`ApplicationOrchestrator`] that wires the above
//!   together, polls health on a timer and runs the single shutdown path.
//!
//! ```text
//!  worker stdout ──► ProcessSupervisor ──► EventSink ──► bridge task ──► EventBroadcaster
//!                         ▲    │                                         │   │   │
//!  send_command ──────────┘    └─ status events                         ws  ws  store
//! ```
//!
//! Hosting concerns (HTTP routes, WebSocket upgrade, config loading, logging
//! setup) live in the `imf-server` binary.

pub mod config;
pub mod contracts;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod shutdown;
pub mod supervisor;

pub use config::RuntimeConfig;
pub use contracts::{Service, ServiceFactory};
pub use events::{
    Event, EventBroadcaster, EventKind, EventSink, SubscriberState, SubscriptionHandle, Transport,
};
pub use orchestrator::{
    ApplicationOrchestrator, HealthSnapshot, OrchestratorError, OrchestratorSettings,
    OrchestratorState, OrchestratorStatus,
};
pub use registry::{
    InitContext, RegistryBuilder, RegistryError, ServiceDescriptor, ServiceHandle,
    ServiceHealthStatus, ServiceRegistry, SharedResources, ShutdownReport,
};
pub use supervisor::{
    ProcessState, ProcessSupervisor, SupervisorError, SupervisorSettings, SupervisorStatus,
};
