//! Line-delimited JSON spoken with the worker over stdin/stdout.
//!
//! Outbound frames are tagged by `type`. Inbound frames are either tagged
//! (`ready`, `heartbeat`, `response`, `event`) or an untagged telemetry
//! bundle holding any of `metrics`, `problems`, `logEntries` and `plugins`.

use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

use crate::events::EventKind;

const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound<'a> {
    Command {
        id: u64,
        name: &'a str,
        args: &'a Value,
        timeout_ms: u64,
    },
    Shutdown,
}

impl Outbound<'_> {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn command_frame(
    id: u64,
    name: &str,
    args: &Value,
    timeout: Duration,
) -> serde_json::Result<String> {
    Outbound::Command {
        id,
        name,
        args,
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
    .encode()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ready(Value),
    Heartbeat,
    Response {
        id: u64,
        outcome: Result<Value, String>,
    },
    Event {
        name: String,
        data: Value,
    },
    Telemetry(Vec<(EventKind, Value)>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("not valid JSON: {0}")]
    Json(String),
    #[error("expected a JSON object")]
    NotAnObject,
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
    #[error("'{frame}' frame is missing '{field}'")]
    MissingField {
        frame: &'static str,
        field: &'static str,
    },
    #[error("object carries no telemetry keys")]
    EmptyTelemetry,
}

pub fn decode(line: &str) -> Result<Inbound, ProtocolError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::Json(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    match obj.get("type").and_then(Value::as_str) {
        Some("ready") => {
            obj.remove("type");
            Ok(Inbound::Ready(Value::Object(obj)))
        }
        Some("heartbeat") => Ok(Inbound::Heartbeat),
        Some("response") => decode_response(&mut obj),
        Some("event") => {
            let name = obj
                .get("event")
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField {
                    frame: "event",
                    field: "event",
                })?
                .to_owned();
            let data = obj.remove("data").unwrap_or(Value::Null);
            Ok(Inbound::Event { name, data })
        }
        Some(other) => Err(ProtocolError::UnknownType(other.to_owned())),
        None => decode_telemetry(obj),
    }
}

fn decode_response(obj: &mut Map<String, Value>) -> Result<Inbound, ProtocolError> {
    let id = obj
        .get("id")
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingField {
            frame: "response",
            field: "id",
        })?;
    let ok = obj
        .get("ok")
        .and_then(Value::as_bool)
        .ok_or(ProtocolError::MissingField {
            frame: "response",
            field: "ok",
        })?;

    let outcome = if ok {
        Ok(obj.remove("result").unwrap_or(Value::Null))
    } else {
        Err(match obj.remove("error") {
            Some(Value::String(msg)) => msg,
            Some(other) => other.to_string(),
            None => "command failed".to_owned(),
        })
    };
    Ok(Inbound::Response { id, outcome })
}

fn decode_telemetry(mut obj: Map<String, Value>) -> Result<Inbound, ProtocolError> {
    let parts: Vec<_> = EventKind::TELEMETRY
        .into_iter()
        .filter_map(|kind| obj.remove(kind.as_str()).map(|payload| (kind, payload)))
        .collect();
    if parts.is_empty() {
        return Err(ProtocolError::EmptyTelemetry);
    }
    Ok(Inbound::Telemetry(parts))
}

/// First characters of a line, for logging rejected output.
pub fn preview(line: &str) -> String {
    let mut chars = line.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_frame_shape() {
        let line = command_frame(7, "scan", &json!({ "path": "/tmp" }), Duration::from_secs(2))
            .unwrap();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            v,
            json!({ "type": "command", "id": 7, "name": "scan", "args": { "path": "/tmp" }, "timeout_ms": 2000 })
        );
        assert_eq!(Outbound::Shutdown.encode().unwrap(), r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn decodes_responses() {
        assert_eq!(
            decode(r#"{"type":"response","id":3,"ok":true,"result":{"n":1}}"#).unwrap(),
            Inbound::Response {
                id: 3,
                outcome: Ok(json!({ "n": 1 }))
            }
        );
        assert_eq!(
            decode(r#"{"type":"response","id":4,"ok":false,"error":"boom"}"#).unwrap(),
            Inbound::Response {
                id: 4,
                outcome: Err("boom".to_owned())
            }
        );
        assert_eq!(
            decode(r#"{"type":"response","ok":true}"#).unwrap_err(),
            ProtocolError::MissingField {
                frame: "response",
                field: "id"
            }
        );
    }

    #[test]
    fn telemetry_bundle_splits_in_fixed_order() {
        let line = r#"{"plugins":[{"name":"cpu"}],"logEntries":[],"metrics":[{"value":1}]}"#;
        let Inbound::Telemetry(parts) = decode(line).unwrap() else {
            panic!("expected telemetry");
        };
        let kinds: Vec<_> = parts.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(kinds, vec!["metrics", "logEntries", "plugins"]);
        assert_eq!(parts[0].1, json!([{ "value": 1 }]));
    }

    #[test]
    fn ready_keeps_extra_fields() {
        assert_eq!(
            decode(r#"{"type":"ready","version":"1.2"}"#).unwrap(),
            Inbound::Ready(json!({ "version": "1.2" }))
        );
        assert_eq!(decode(r#"{"type":"heartbeat"}"#).unwrap(), Inbound::Heartbeat);
    }

    #[test]
    fn application_events_use_their_own_name() {
        assert_eq!(
            decode(r#"{"type":"event","event":"scanFinished","data":{"files":3}}"#).unwrap(),
            Inbound::Event {
                name: "scanFinished".to_owned(),
                data: json!({ "files": 3 })
            }
        );
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(matches!(decode("Collected metrics: {}"), Err(ProtocolError::Json(_))));
        assert_eq!(decode("[1,2]").unwrap_err(), ProtocolError::NotAnObject);
        assert_eq!(decode(r#"{"other":1}"#).unwrap_err(), ProtocolError::EmptyTelemetry);
        assert_eq!(
            decode(r#"{"type":"bogus"}"#).unwrap_err(),
            ProtocolError::UnknownType("bogus".to_owned())
        );
    }

    #[test]
    fn preview_truncates_long_lines() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(500);
        let p = preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 1);
        assert!(p.ends_with('…'));
    }
}
