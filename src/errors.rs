//! Error types for candidate selection and dispatch
//!
//! Failures come in two flavours. A [`CandidateFailure`] belongs to a single backend and only
//! ever advances the dispatch loop to the next candidate. A [`DispatchError`] is terminal for the
//! request and is rendered to the caller as a structured JSON envelope.
use crate::registry::{RegistryError, ServerType};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

/// Why a single candidate was passed over.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CandidateFailure {
    #[error("health check failed for {server_url}: {detail}")]
    Unhealthy { server_url: String, detail: String },

    #[error(
        "insufficient resources on {server_url} (type: {server_type}, required: {required_gb}GB, \
         available: {available_gb:.1}GB/{total_gb:.1}GB, usage: {usage_percentage:.1}%)"
    )]
    ResourceInsufficient {
        server_url: String,
        server_type: ServerType,
        required_gb: f64,
        available_gb: f64,
        total_gb: f64,
        usage_percentage: f64,
    },

    #[error("resource check against {server_url} failed: {detail}")]
    ResourceCheckTransport { server_url: String, detail: String },

    #[error("backend {server_url} answered {status}: {detail}")]
    BackendStatus {
        server_url: String,
        status: StatusCode,
        detail: String,
    },

    #[error("request to {server_url} failed: {detail}")]
    BackendTransport { server_url: String, detail: String },

    /// The request itself cannot be sent anywhere; retrying another backend is pointless.
    #[error("request cannot be forwarded: {0}")]
    NonRetriable(String),
}

impl CandidateFailure {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, CandidateFailure::NonRetriable(_))
    }

    /// Log the failure against the attempt it ended.
    pub(crate) fn log(&self, request_id: &str, attempt: usize, total: usize) {
        match self {
            // A monitor that cannot be reached usually means a misconfigured port, not load.
            CandidateFailure::ResourceCheckTransport { .. } | CandidateFailure::NonRetriable(_) => {
                error!(request_id, attempt, total, reason = %self, "Candidate failed");
            }
            _ => warn!(request_id, attempt, total, reason = %self, "Candidate failed"),
        }
    }
}

/// A failure after a stream has started emitting to the caller. It cannot fall back to another
/// candidate and is reported in-band as the final chunk.
#[derive(Debug, Clone, thiserror::Error)]
#[error("stream from {server_url} interrupted: {detail}")]
pub struct StreamMidFlightError {
    pub server_url: String,
    pub detail: String,
}

/// Terminal outcome of a dispatch call.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("virtual model {model} has no active servers configured")]
    NoServersConfigured { model: String },

    #[error("all {attempts} servers for virtual model {model} are unavailable, last error: {last_error}")]
    Exhausted {
        model: String,
        attempts: usize,
        last_error: CandidateFailure,
    },

    #[error("failed to read the server registry: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    NonRetriable(CandidateFailure),

    #[error("{0}")]
    InvalidRequest(String),
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::NoServersConfigured { .. } | DispatchError::Exhausted { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::NonRetriable(_) => StatusCode::BAD_GATEWAY,
            DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            DispatchError::NoServersConfigured { .. } => "configuration_error",
            DispatchError::Exhausted { .. } => "exhausted_candidates",
            DispatchError::Registry(_) => "registry_error",
            DispatchError::NonRetriable(_) => "upstream_error",
            DispatchError::InvalidRequest(_) => "invalid_request_error",
        }
    }

    /// Number of candidates tried before giving up, when the loop ran at all.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            DispatchError::Exhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "message": self.to_string(),
            "type": self.error_type(),
        });
        if let Some(attempts) = self.attempts() {
            body["attempts"] = json!(attempts);
        }
        (self.status_code(), Json(json!({ "error": body }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_envelope_carries_attempt_count() {
        let err = DispatchError::Exhausted {
            model: "qwen3".into(),
            attempts: 3,
            last_error: CandidateFailure::BackendTransport {
                server_url: "http://c.test:11434/".into(),
                detail: "connection refused".into(),
            },
        };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.attempts(), Some(3));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn only_non_retriable_failures_stop_the_loop() {
        let unhealthy = CandidateFailure::Unhealthy {
            server_url: "http://a.test/".into(),
            detail: "timeout".into(),
        };
        assert!(unhealthy.is_retriable());
        assert!(!CandidateFailure::NonRetriable("bad body".into()).is_retriable());
    }
}
