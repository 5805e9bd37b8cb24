// src/error.rs
use hyper::{Body, Response, StatusCode};

/// Failures a request can carry in its context's error slot.
///
/// None of these cross the Gateway boundary: the Gateway always maps them to
/// a response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("no server available for target '{target}'")]
    NoServerAvailable { target: String },

    #[error("outbound call to target '{target}' timed out after {timeout_ms}ms")]
    OutboundTimeout { target: String, timeout_ms: u64 },

    #[error("outbound connection to target '{target}' failed: {reason}")]
    OutboundConnectionFailure { target: String, reason: String },

    #[error("filter '{filter}' failed: {reason}")]
    FilterExecutionFailure { filter: String, reason: String },

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NoServerAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::OutboundTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::OutboundConnectionFailure { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::FilterExecutionFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine-readable name used in error bodies and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NoServerAvailable { .. } => "no_server_available",
            GatewayError::OutboundTimeout { .. } => "outbound_timeout",
            GatewayError::OutboundConnectionFailure { .. } => "outbound_connection_failure",
            GatewayError::FilterExecutionFailure { .. } => "filter_execution_failure",
            GatewayError::BadRequest(_) => "bad_request",
        }
    }

    /// Reason safe to show a client. Upstream addresses and inner error
    /// chains stay in the logs.
    pub fn public_reason(&self) -> String {
        match self {
            GatewayError::NoServerAvailable { target } => {
                format!("No server available for '{}'", target)
            }
            GatewayError::OutboundTimeout { target, .. } => {
                format!("Upstream '{}' timed out", target)
            }
            GatewayError::OutboundConnectionFailure { target, .. } => {
                format!("Upstream '{}' unreachable", target)
            }
            GatewayError::FilterExecutionFailure { filter, .. } => {
                format!("Filter '{}' failed", filter)
            }
            GatewayError::BadRequest(reason) => format!("Bad request: {}", reason),
        }
    }
}

// Fallback rendering when no error filter handled the failure.
impl From<&GatewayError> for Response<Body> {
    fn from(err: &GatewayError) -> Self {
        let mut response = Response::new(Body::from(err.public_reason()));
        *response.status_mut() = err.status();
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}
