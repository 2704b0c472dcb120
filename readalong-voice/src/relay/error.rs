use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

use crate::network::error::NetworkError;

/// Relay server errors
#[derive(Error, Debug)]
pub enum RelayError {
    /// Listener could not be bound
    #[error("Failed to bind relay listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Missing or rejected credential/identity on upgrade
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Upgrade query is malformed
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Upstream provider socket failed
    #[error("Upstream error: {0}")]
    Upstream(#[from] NetworkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RelayError::Bind { .. } | RelayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct RelayErrorBody {
    error: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(RelayErrorBody { error: self.to_string() })).into_response()
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
