use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Event;

/// The outbound half of one subscriber connection.
///
/// `deliver` is awaited by the subscriber's own delivery task, so a slow
/// transport only ever delays its own queue. Returning an error detaches the
/// subscriber.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn deliver(&self, event: &Event) -> anyhow::Result<()>;

    /// Called once after the last delivery.
    async fn close(&self) {}
}

/// Transport that forwards events into a bounded channel.
///
/// Used by connection tasks that own a socket and by tests.
pub struct ChannelTransport {
    tx: mpsc::Sender<Event>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn deliver(&self, event: &Event) -> anyhow::Result<()> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| anyhow::anyhow!("subscriber channel closed"))
    }
}
