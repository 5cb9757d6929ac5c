//! HTTP-facing errors for the relay endpoint
//!
//! Every variant renders as `{"error":{"type":..,"message":..}}` with the CORS
//! headers attached, so browser callers can read the failure.

use axum::{
    body::Body,
    http::{HeaderMap, Response, StatusCode, header},
    response::IntoResponse,
};
use thiserror::Error;
use tracing::{error, warn};

use crate::error::RelayError;

use super::server::apply_cors;

/// Errors returned to the relay caller
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("Method {0} is not allowed")]
    MethodNotAllowed(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Configuration(String),

    #[error("{0}")]
    SourceUnavailable(String),

    #[error("{0}")]
    UpstreamExhausted(String),

    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::SourceUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::UpstreamExhausted(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the `error.type` field
    pub fn category(&self) -> &'static str {
        match self {
            ProxyError::MethodNotAllowed(_) => "method_not_allowed",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::Configuration(_) => "configuration_error",
            ProxyError::SourceUnavailable(_) => "source_unavailable",
            ProxyError::UpstreamExhausted(_) => "upstream_exhausted",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    pub fn into_response(self) -> Response<Body> {
        let status = self.status();
        if status.is_server_error() {
            error!(category = self.category(), "Relay request failed: {self}");
        } else {
            warn!(category = self.category(), "Relay request rejected: {self}");
        }
        create_error_response(status, self.category(), &self.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        ProxyError::into_response(self)
    }
}

impl From<RelayError> for ProxyError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::SourceUnavailable { .. } => ProxyError::SourceUnavailable(err.to_string()),
            RelayError::UpstreamExhausted { .. } => ProxyError::UpstreamExhausted(err.to_string()),
            RelayError::Config(msg) => ProxyError::Configuration(msg),
            RelayError::InvalidRequest(msg) => ProxyError::InvalidRequest(msg),
            other => ProxyError::Internal(other.to_string()),
        }
    }
}

/// JSON error body with CORS headers
pub fn create_error_response(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });

    let mut headers = HeaderMap::new();
    apply_cors(&mut headers);
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
