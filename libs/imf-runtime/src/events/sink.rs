use tokio::sync::mpsc;

use super::Event;

/// Producer side of the channel that carries events from services to the
/// broadcaster.
///
/// Publishing never blocks. A sink created with [`EventSink::noop`] discards
/// everything, which is what tests and detached services use.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Returns `false` when the event went nowhere.
    pub fn publish(&self, event: Event) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn noop_sink_discards() {
        let sink = EventSink::noop();
        assert!(!sink.is_connected());
        assert!(!sink.publish(Event::status(json!({}))));
    }

    #[test]
    fn channel_sink_delivers_until_receiver_drops() {
        let (sink, mut rx) = EventSink::channel();
        assert!(sink.publish(Event::status(json!({ "state": "running" }))));
        assert_eq!(rx.try_recv().unwrap().payload()["state"], "running");

        drop(rx);
        assert!(!sink.is_connected());
        assert!(!sink.publish(Event::status(json!({}))));
    }
}
