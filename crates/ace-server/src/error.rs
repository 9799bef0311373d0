//! HTTP error boundary. Every crate's narrower error type converts into
//! `ace_types::CoreError` already; this is the one place that turns
//! `CoreError` into a response, following
//! `vpn-identity/src/bin/vpn-identity.rs`'s `IntoResponse for IdentityError`
//! match-arm shape (spec §7 propagation policy).

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use ace_types::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,
}

impl From<ace_net::NetError> for ApiError {
    fn from(e: ace_net::NetError) -> Self {
        ApiError::Core(e.into())
    }
}

impl From<ace_docker::error::DockerError> for ApiError {
    fn from(e: ace_docker::error::DockerError) -> Self {
        ApiError::Core(e.into())
    }
}

impl From<ace_state::StateError> for ApiError {
    fn from(e: ace_state::StateError) -> Self {
        ApiError::Core(e.into())
    }
}

impl From<ace_control::ControlError> for ApiError {
    fn from(e: ace_control::ControlError) -> Self {
        ApiError::Core(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retry_after) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, None),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, None),
            ApiError::Core(CoreError::Validation(_)) => (StatusCode::BAD_REQUEST, None),
            ApiError::Core(CoreError::NotFound(_)) => (StatusCode::NOT_FOUND, None),
            ApiError::Core(CoreError::Conflict(_)) => (StatusCode::CONFLICT, None),
            ApiError::Core(CoreError::AtCapacity)
            | ApiError::Core(CoreError::PortExhausted)
            | ApiError::Core(CoreError::NoVpnAvailable) => {
                (StatusCode::SERVICE_UNAVAILABLE, Some(5))
            }
            ApiError::Core(CoreError::CircuitOpen) => (StatusCode::SERVICE_UNAVAILABLE, Some(30)),
            ApiError::Core(CoreError::ContainerStartFailed(_))
            | ApiError::Core(CoreError::Timeout(_))
            | ApiError::Core(CoreError::Internal(_)) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let body = Json(serde_json::json!({ "error": self.to_string() }));
        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from_static(match secs {
                    5 => "5",
                    30 => "30",
                    _ => "5",
                }));
        }
        response
    }
}
