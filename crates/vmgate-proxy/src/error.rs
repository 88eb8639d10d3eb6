//! Error taxonomy for request handling
//!
//! Every variant is scoped to one request or one relay session.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use vmgate_discovery::DiscoveryError;

use crate::relay::Leg;

/// Failures of the HTTP forwarder
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),
}

/// The inbound socket upgrade did not complete
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("Origin not permitted: {0}")]
    OriginRejected(String),

    #[error("Upgrade handshake failed: {0}")]
    Handshake(String),
}

/// Mid-session failure on one leg of a relay
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayFault {
    #[error("Failed to dial backend socket: {0}")]
    Dial(String),

    #[error("{leg} read failed: {reason}")]
    Read { leg: Leg, reason: String },

    #[error("{leg} write failed: {reason}")]
    Write { leg: Leg, reason: String },

    #[error("{0} forwarding task panicked")]
    Panicked(Leg),
}

/// Anything a gateway handler can answer with instead of a proxied response
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Upgrade(#[from] UpgradeError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Discovery(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Proxy(ProxyError::BadRequest(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Proxy(ProxyError::BackendUnreachable(_)) => StatusCode::BAD_GATEWAY,
            GatewayError::Upgrade(UpgradeError::OriginRejected(_)) => StatusCode::FORBIDDEN,
            GatewayError::Upgrade(UpgradeError::Handshake(_)) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Discovery(e) => e.kind(),
            GatewayError::Proxy(ProxyError::BadRequest(_)) => "bad_request",
            GatewayError::Proxy(ProxyError::BackendUnreachable(_)) => "backend_unreachable",
            GatewayError::Upgrade(UpgradeError::OriginRejected(_)) => "origin_rejected",
            GatewayError::Upgrade(UpgradeError::Handshake(_)) => "upgrade_failed",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
