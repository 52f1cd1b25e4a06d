use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Type tag of an [`Event`].
///
/// The first four mirror the keys of a worker telemetry bundle; `Status`
/// carries supervisor state transitions; anything else is application-level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Problems,
    Metrics,
    LogEntries,
    Plugins,
    Status,
    Custom(String),
}

impl EventKind {
    /// Telemetry kinds in the order they are published from one bundle.
    pub const TELEMETRY: [EventKind; 4] = [
        EventKind::Metrics,
        EventKind::Problems,
        EventKind::LogEntries,
        EventKind::Plugins,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Problems => "problems",
            Self::Metrics => "metrics",
            Self::LogEntries => "logEntries",
            Self::Plugins => "plugins",
            Self::Status => "status",
            Self::Custom(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "problems" => Self::Problems,
            "metrics" => Self::Metrics,
            "logEntries" => Self::LogEntries,
            "plugins" => Self::Plugins,
            "status" => Self::Status,
            other => Self::Custom(other.to_owned()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

/// An immutable, timestamped notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    kind: EventKind,
    payload: Value,
    emitted_at: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: impl Into<EventKind>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            emitted_at: Utc::now(),
        }
    }

    pub fn status(payload: Value) -> Self {
        Self::new(EventKind::Status, payload)
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    /// Wire form pushed to transport subscribers.
    pub fn envelope(&self) -> Envelope<'_> {
        Envelope {
            kind: self.kind.as_str(),
            data: &self.payload,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.envelope())
    }
}

/// `{"type": ..., "data": ...}`, one message per event.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub data: &'a Value,
}
