//! Forwarding of worker stderr into tracing.
//!
//! Each line is re-emitted at the level it was written with. Recognized
//! layouts:
//!
//! ```text
//! {"level":"warning","message":"..."}                            JSON logger
//! 2025-01-07 10:12:01,532 - collector - WARNING - disk at 91%    logging.Formatter
//! ERROR:root:plugin crashed                                      logging default
//! 2025-01-07T10:12:01Z  INFO worker: started                     tracing-subscriber
//! ```
//!
//! Anything else is forwarded at INFO.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

fn parse_level(token: &str) -> Option<Level> {
    match token.trim().to_ascii_uppercase().as_str() {
        "CRITICAL" | "FATAL" | "ERROR" => Some(Level::ERROR),
        "WARNING" | "WARN" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    }
}

fn json_level(line: &str) -> Option<Level> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    let v: Value = serde_json::from_str(trimmed).ok()?;
    let level = v.get("level").or_else(|| v.get("levelname"))?.as_str()?;
    parse_level(level)
}

fn dash_separated_level(line: &str) -> Option<Level> {
    line.split(" - ").skip(1).take(3).find_map(parse_level)
}

fn colon_prefixed_level(line: &str) -> Option<Level> {
    let (head, _) = line.split_once(':')?;
    parse_level(head)
}

fn whitespace_level(line: &str) -> Option<Level> {
    line.split_whitespace().take(2).find_map(parse_level)
}

pub(crate) fn detect_log_level(line: &str) -> Level {
    json_level(line)
        .or_else(|| dash_separated_level(line))
        .or_else(|| colon_prefixed_level(line))
        .or_else(|| whitespace_level(line))
        .unwrap_or(Level::INFO)
}

fn forward_line(worker: &str, instance_id: Uuid, pid: Option<u32>, line: &str) {
    match detect_log_level(line) {
        Level::ERROR => {
            tracing::error!(worker = %worker, worker_instance = %instance_id, worker_pid = ?pid, "{line}");
        }
        Level::WARN => {
            tracing::warn!(worker = %worker, worker_instance = %instance_id, worker_pid = ?pid, "{line}");
        }
        Level::INFO => {
            tracing::info!(worker = %worker, worker_instance = %instance_id, worker_pid = ?pid, "{line}");
        }
        Level::DEBUG => {
            tracing::debug!(worker = %worker, worker_instance = %instance_id, worker_pid = ?pid, "{line}");
        }
        Level::TRACE => {
            tracing::trace!(worker = %worker, worker_instance = %instance_id, worker_pid = ?pid, "{line}");
        }
    }
}

/// Reads `stream` line by line until EOF, a read error or `cancel`.
pub(crate) fn spawn_log_forwarder<S>(
    stream: S,
    worker: String,
    instance_id: Uuid,
    pid: Option<u32>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                next = lines.next_line() => match next {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => forward_line(&worker, instance_id, pid, &line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(worker = %worker, worker_instance = %instance_id, error = %e, "worker stderr read error");
                        break;
                    }
                },
            }
        }
        tracing::debug!(worker = %worker, worker_instance = %instance_id, "worker stderr closed");
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn python_formatter_levels() {
        assert_eq!(
            detect_log_level("2025-01-07 10:12:01,532 - __main__ - WARNING - disk usage at 91%"),
            Level::WARN
        );
        assert_eq!(
            detect_log_level("2025-01-07 10:12:01,532 - collector - CRITICAL - plugin crashed"),
            Level::ERROR
        );
        assert_eq!(
            detect_log_level("2025-01-07 10:12:01,532 - collector - DEBUG - tick"),
            Level::DEBUG
        );
    }

    #[test]
    fn python_default_format() {
        assert_eq!(detect_log_level("ERROR:root:cannot open log file"), Level::ERROR);
        assert_eq!(detect_log_level("WARNING:asyncio:slow callback"), Level::WARN);
    }

    #[test]
    fn json_levels() {
        assert_eq!(detect_log_level(r#"{"level":"warning","message":"x"}"#), Level::WARN);
        assert_eq!(detect_log_level(r#"{"levelname":"ERROR","msg":"x"}"#), Level::ERROR);
        assert_eq!(detect_log_level(r#"{"message":"no level"}"#), Level::INFO);
    }

    #[test]
    fn tracing_subscriber_format() {
        assert_eq!(
            detect_log_level("2025-12-08T00:10:18.2852399Z  WARN worker: queue full"),
            Level::WARN
        );
        assert_eq!(detect_log_level("TRACE entering loop"), Level::TRACE);
    }

    #[test]
    fn unrecognized_lines_default_to_info() {
        assert_eq!(detect_log_level("Traceback (most recent call last):"), Level::INFO);
        assert_eq!(detect_log_level("  File \"main.py\", line 3"), Level::INFO);
        assert_eq!(detect_log_level(""), Level::INFO);
    }
}
