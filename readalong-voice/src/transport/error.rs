use thiserror::Error;

use crate::audio::error::AudioError;
use crate::credentials::CredentialError;
use crate::network::error::NetworkError;
use crate::network::protocol::ProviderError;
use crate::reconnect::RetryableError;
use crate::utils::error::ErrorKind;

/// Provider error codes after which the session cannot continue
const FATAL_PROVIDER_CODES: &[&str] = &[
    "invalid_api_key",
    "insufficient_quota",
    "model_not_found",
    "session_expired",
];

/// Provider error codes a fresh session is expected to clear
const RETRYABLE_PROVIDER_CODES: &[&str] = &["session_expired", "server_error"];

/// Transport client errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Credential could not be obtained or was rejected
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Microphone or playback failure
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    /// SDP offer/answer exchange failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Explicit error payload from the provider
    #[error("Provider error{}: {message}", code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Provider {
        code: Option<String>,
        message: String,
        fatal: bool,
        retryable: bool,
    },

    /// Repeated malformed or unexpected frames
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// `connect()` while already connecting or connected
    #[error("Transport is already connected or connecting")]
    AlreadyConnected,

    #[error("Transport is not connected")]
    NotConnected,

    /// Session did not become ready in time
    #[error("Session not ready after {0}ms")]
    Timeout(u64),

    /// Link dropped before or after the session became ready
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// Classify a provider `error` event
    pub fn from_provider(error: &ProviderError) -> Self {
        let code = error.code.as_deref().unwrap_or_default();
        let fatal = FATAL_PROVIDER_CODES.contains(&code);
        let retryable = RETRYABLE_PROVIDER_CODES.contains(&code)
            || error.error_type == "server_error";

        TransportError::Provider {
            code: error.code.clone(),
            message: error.message.clone(),
            fatal,
            retryable,
        }
    }

    /// Position in the error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Credential(e) if e.is_rate_limited() => ErrorKind::RateLimit,
            TransportError::Credential(_) => ErrorKind::Credential,
            TransportError::Network(NetworkError::AuthenticationFailed) => ErrorKind::Credential,
            TransportError::Network(_)
            | TransportError::Negotiation(_)
            | TransportError::Timeout(_)
            | TransportError::ConnectionLost(_) => ErrorKind::Transport,
            TransportError::Audio(e) if e.is_resource_error() => ErrorKind::Resource,
            TransportError::Audio(_) => ErrorKind::Transport,
            TransportError::Provider { .. } => ErrorKind::Provider,
            TransportError::Protocol(_) => ErrorKind::Protocol,
            TransportError::AlreadyConnected
            | TransportError::NotConnected
            | TransportError::InvalidConfig(_) => ErrorKind::Internal,
        }
    }

    /// Whether a fresh connection attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Credential(e) => e.is_retryable(),
            TransportError::Network(e) => e.is_retryable(),
            TransportError::Audio(e) => !e.is_resource_error(),
            TransportError::Provider { retryable, .. } => *retryable,
            TransportError::Negotiation(_)
            | TransportError::Protocol(_)
            | TransportError::Timeout(_)
            | TransportError::ConnectionLost(_) => true,
            TransportError::AlreadyConnected
            | TransportError::NotConnected
            | TransportError::InvalidConfig(_) => false,
        }
    }

    /// Whether the session must be torn down
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::Provider { fatal, .. } => *fatal,
            TransportError::Protocol(_) | TransportError::ConnectionLost(_) => true,
            _ => false,
        }
    }
}

impl RetryableError for TransportError {
    fn is_retryable(&self) -> bool {
        TransportError::is_retryable(self)
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(code: &str, error_type: &str) -> ProviderError {
        ProviderError {
            error_type: error_type.to_string(),
            code: Some(code.to_string()),
            message: "boom".to_string(),
            param: None,
        }
    }

    #[test]
    fn test_provider_classification() {
        let err = TransportError::from_provider(&provider("invalid_api_key", "invalid_request_error"));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Provider);

        let err = TransportError::from_provider(&provider("session_expired", "invalid_request_error"));
        assert!(err.is_fatal());
        assert!(err.is_retryable());

        let err = TransportError::from_provider(&provider("buffer_too_small", "invalid_request_error"));
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("buffer_too_small"));
    }

    #[test]
    fn test_resource_errors_never_retried() {
        let err = TransportError::Audio(AudioError::PermissionDenied("user said no".into()));
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rate_limit_kind() {
        let err = TransportError::Credential(CredentialError::RateLimitExceeded {
            caller_id: "s1".into(),
            retry_after: std::time::Duration::from_secs(3),
        });
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert!(!err.is_retryable());

        let err = TransportError::Network(NetworkError::Timeout(10_000));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());
    }
}
