//! Typed events and their fan-out to transport subscribers.

mod broadcaster;
mod event;
mod sink;
mod throttle;
mod transport;

pub use broadcaster::{
    DEFAULT_QUEUE_CAPACITY, EventBroadcaster, SubscriberQueueOverflow, SubscriberState,
    SubscriberStats, SubscriptionHandle,
};
pub use event::{Envelope, Event, EventKind};
pub use sink::EventSink;
pub use throttle::ThrottledLog;
pub use transport::{ChannelTransport, Transport};
