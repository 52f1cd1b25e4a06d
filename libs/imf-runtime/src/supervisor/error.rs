use std::time::Duration;

use super::ProcessState;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("failed to start worker '{worker}': {reason}")]
    ProcessSpawn { worker: String, reason: String },

    #[error("worker '{worker}' is not running (state: {state})")]
    ProcessNotRunning { worker: String, state: ProcessState },

    #[error("command '{name}' (id {id}) timed out after {}ms", timeout.as_millis())]
    CommandTimeout {
        id: u64,
        name: String,
        timeout: Duration,
    },

    #[error("command '{name}' (id {id}) failed: {reason}")]
    CommandFailure { id: u64, name: String, reason: String },

    #[error("failed to encode frame for worker: {0}")]
    Encode(String),
}
