use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire error codes of the issuance endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialErrorCode {
    InvalidRequest,
    InvalidLanguage,
    RateLimitExceeded,
    UpstreamError,
    InternalError,
}

/// Credential issuance errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    /// Request body is missing or malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Language is not one the platform supports
    #[error("Unsupported language: {0}")]
    InvalidLanguage(String),

    /// Caller exceeded its issuance window
    #[error("Rate limit exceeded for {caller_id}, retry in {}s", retry_after.as_secs())]
    RateLimitExceeded {
        caller_id: String,
        retry_after: Duration,
    },

    /// Provider refused or failed to mint a secret
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Credential was already bound to a session
    #[error("Credential for session {0} was already used")]
    AlreadyConsumed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CredentialError {
    pub fn code(&self) -> CredentialErrorCode {
        match self {
            CredentialError::InvalidRequest(_) | CredentialError::AlreadyConsumed(_) => {
                CredentialErrorCode::InvalidRequest
            }
            CredentialError::InvalidLanguage(_) => CredentialErrorCode::InvalidLanguage,
            CredentialError::RateLimitExceeded { .. } => CredentialErrorCode::RateLimitExceeded,
            CredentialError::Upstream(_) => CredentialErrorCode::UpstreamError,
            CredentialError::Internal(_) => CredentialErrorCode::InternalError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code() {
            CredentialErrorCode::InvalidRequest | CredentialErrorCode::InvalidLanguage => {
                StatusCode::BAD_REQUEST
            }
            CredentialErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            CredentialErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
            CredentialErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Requesting a new credential later may succeed
    ///
    /// Rate-limit errors are surfaced immediately and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CredentialError::Upstream(_) | CredentialError::Internal(_)
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, CredentialError::RateLimitExceeded { .. })
    }

    /// Rebuild an error from a `{error, code}` body
    pub fn from_body(body: ErrorBody) -> Self {
        match body.code {
            CredentialErrorCode::InvalidRequest => CredentialError::InvalidRequest(body.error),
            CredentialErrorCode::InvalidLanguage => CredentialError::InvalidLanguage(body.error),
            CredentialErrorCode::RateLimitExceeded => CredentialError::RateLimitExceeded {
                caller_id: String::new(),
                retry_after: Duration::ZERO,
            },
            CredentialErrorCode::UpstreamError => CredentialError::Upstream(body.error),
            CredentialErrorCode::InternalError => CredentialError::Internal(body.error),
        }
    }
}

/// Error response body: `{ "error": "...", "code": "RATE_LIMIT_EXCEEDED" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: CredentialErrorCode,
}

impl IntoResponse for CredentialError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for credential operations
pub type CredentialResult<T> = Result<T, CredentialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (CredentialError::InvalidRequest("x".into()), 400),
            (CredentialError::InvalidLanguage("fr".into()), 400),
            (
                CredentialError::RateLimitExceeded {
                    caller_id: "s1".into(),
                    retry_after: Duration::from_secs(5),
                },
                429,
            ),
            (CredentialError::Upstream("down".into()), 502),
            (CredentialError::Internal("bug".into()), 500),
            (CredentialError::AlreadyConsumed("sess".into()), 400),
        ];

        for (error, status) in cases {
            assert_eq!(error.status().as_u16(), status, "{error}");
        }
    }

    #[test]
    fn test_error_body_wire_format() {
        let body = ErrorBody {
            error: "slow down".to_string(),
            code: CredentialErrorCode::RateLimitExceeded,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"error":"slow down","code":"RATE_LIMIT_EXCEEDED"}"#);

        let parsed: ErrorBody = serde_json::from_str(&json).unwrap();
        assert!(CredentialError::from_body(parsed).is_rate_limited());
    }

    #[test]
    fn test_retryability() {
        assert!(CredentialError::Upstream("503".into()).is_retryable());
        assert!(!CredentialError::InvalidLanguage("fr".into()).is_retryable());
        assert!(
            !CredentialError::RateLimitExceeded {
                caller_id: "a".into(),
                retry_after: Duration::ZERO
            }
            .is_retryable()
        );
    }
}
