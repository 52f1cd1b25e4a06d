//! RFC 9457 problem details for HTTP error responses.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Serialize, Serializer};

use imf_runtime::SupervisorError;

pub const APPLICATION_PROBLEM_JSON: &str = "application/problem+json";

#[allow(clippy::trivially_copy_pass_by_ref)] // serde requires &T signature
fn serialize_status_code<S>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u16(status.as_u16())
}

#[derive(Debug, Clone, Serialize)]
#[must_use]
pub struct Problem {
    #[serde(rename = "type")]
    pub type_url: String,
    pub title: String,
    #[serde(serialize_with = "serialize_status_code")]
    pub status: StatusCode,
    pub detail: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub code: String,
}

impl Problem {
    pub fn new(status: StatusCode, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            type_url: "about:blank".to_owned(),
            title: title.into(),
            status,
            detail: detail.into(),
            code: String::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn worker_disabled() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Worker Disabled",
            "the monitor worker is not configured on this server",
        )
        .with_code("WORKER_DISABLED")
    }
}

impl From<SupervisorError> for Problem {
    fn from(err: SupervisorError) -> Self {
        let (status, title, code) = match &err {
            SupervisorError::ProcessNotRunning { .. } => {
                (StatusCode::CONFLICT, "Worker Not Running", "PROCESS_NOT_RUNNING")
            }
            SupervisorError::CommandTimeout { .. } => {
                (StatusCode::GATEWAY_TIMEOUT, "Command Timed Out", "COMMAND_TIMEOUT")
            }
            SupervisorError::CommandFailure { .. } => {
                (StatusCode::BAD_GATEWAY, "Command Failed", "COMMAND_FAILURE")
            }
            SupervisorError::ProcessSpawn { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Worker Spawn Failed",
                "PROCESS_SPAWN",
            ),
            SupervisorError::Encode(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Encoding Failed",
                "ENCODE",
            ),
        };
        Self::new(status, title, err.to_string()).with_code(code)
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status = self.status;
        let mut resp = axum::Json(self).into_response();
        *resp.status_mut() = status;
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(APPLICATION_PROBLEM_JSON),
        );
        resp
    }
}
