//! Latest payload per event type, for clients that poll instead of holding
//! a WebSocket open.
//!
//! The store subscribes to the broadcaster like any other client, so it sees
//! exactly what WebSocket subscribers see, including overflow drops.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use imf_runtime::{
    Event, EventBroadcaster, InitContext, Service, ServiceDescriptor, SubscriberState,
    SubscriptionHandle, Transport,
};

pub const SERVICE_NAME: &str = "telemetry-store";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub data: Value,
    pub received_at: DateTime<Utc>,
    /// Events of this type seen since the store attached.
    pub count: u64,
}

type Snapshots = Arc<RwLock<BTreeMap<String, Snapshot>>>;

pub struct TelemetryStore {
    snapshots: Snapshots,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

struct StoreTransport {
    snapshots: Snapshots,
}

#[async_trait]
impl Transport for StoreTransport {
    async fn deliver(&self, event: &Event) -> anyhow::Result<()> {
        let mut snapshots = self.snapshots.write();
        match snapshots.get_mut(event.kind().as_str()) {
            Some(snapshot) => {
                snapshot.data.clone_from(event.payload());
                snapshot.received_at = event.emitted_at();
                snapshot.count += 1;
            }
            None => {
                snapshots.insert(
                    event.kind().as_str().to_owned(),
                    Snapshot {
                        data: event.payload().clone(),
                        received_at: event.emitted_at(),
                        count: 1,
                    },
                );
            }
        }
        Ok(())
    }
}

impl TelemetryStore {
    pub fn attach(broadcaster: &EventBroadcaster) -> Self {
        let snapshots = Snapshots::default();
        let handle = broadcaster.subscribe(Arc::new(StoreTransport {
            snapshots: Arc::clone(&snapshots),
        }));
        tracing::debug!(subscriber = handle.id(), "telemetry store attached");
        Self {
            snapshots,
            subscription: Mutex::new(Some(handle)),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, Snapshot> {
        self.snapshots.read().clone()
    }

    pub fn latest(&self, kind: &str) -> Option<Snapshot> {
        self.snapshots.read().get(kind).cloned()
    }
}

#[async_trait]
impl Service for TelemetryStore {
    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.subscription.lock().take() {
            handle.unsubscribe();
        }
        Ok(())
    }

    async fn health(&self) -> anyhow::Result<Option<String>> {
        let state = self.subscription.lock().as_ref().map(SubscriptionHandle::state);
        match state {
            Some(SubscriberState::Connected) => {
                let kinds = self.snapshots.read().len();
                Ok(Some(format!("{kinds} event type(s) cached")))
            }
            Some(state) => anyhow::bail!("subscription is {}", state_name(state)),
            None => anyhow::bail!("not subscribed"),
        }
    }
}

fn state_name(state: SubscriberState) -> &'static str {
    match state {
        SubscriberState::Connected => "connected",
        SubscriberState::Draining => "draining",
        SubscriberState::Closed => "closed",
    }
}

pub fn descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(SERVICE_NAME, &[], |ctx: InitContext| async move {
        Ok(Arc::new(TelemetryStore::attach(ctx.broadcaster())) as Arc<dyn Service>)
    })
}
