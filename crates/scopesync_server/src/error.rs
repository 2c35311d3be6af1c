//! Error types for the sync server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use scopesync_engine::SyncError;
use scopesync_protocol::{ErrorBody, ProtocolError};
use thiserror::Error;

/// Result type for server lifecycle operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors starting or running the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Binding or serving failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned by a request handler.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request body could not be decoded.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The peer rejected the request.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl ApiError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Sync(err) => StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Wire representation of the error.
    pub fn body(&self) -> ErrorBody {
        match self {
            Self::BadRequest(message) => ErrorBody::new("protocol_error", message.clone(), false),
            Self::Sync(err) => err.to_error_body(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, "sync request failed");
        } else {
            tracing::debug!(error = %self, "sync request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
