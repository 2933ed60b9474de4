//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use message_bus::BusError;
use state_store::StateStoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// The request lacks the key parameter.
    BadRequest(String),
    /// No record is stored under the key.
    NotFound(String),
    /// The store could not answer in time.
    StoreUnavailable(String),
    /// The message bus did not take the event.
    BusUnavailable(String),
    /// Internal server error.
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::StoreUnavailable(_) | ApiError::BusUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) => {
                tracing::debug!(%status, error = %msg, "query rejected");
                msg
            }
            ApiError::StoreUnavailable(msg) => {
                tracing::warn!(error = %msg, "state store unavailable");
                msg
            }
            ApiError::BusUnavailable(msg) => {
                tracing::warn!(error = %msg, "message bus unavailable");
                msg
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                msg
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<StateStoreError> for ApiError {
    fn from(err: StateStoreError) -> Self {
        if err.is_transient() {
            ApiError::StoreUnavailable(err.to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Transient(_) => ApiError::BusUnavailable(err.to_string()),
            BusError::InvalidMessage { .. } => ApiError::BadRequest(err.to_string()),
        }
    }
}
