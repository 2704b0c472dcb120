use thiserror::Error;

use crate::credentials::CredentialError;
use crate::transport::TransportError;
use crate::utils::error::ErrorKind;

/// Session orchestration errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// The connection state machine is already in use
    #[error("Session is already running")]
    AlreadyRunning,

    #[error("Session is not running")]
    NotRunning,

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::AlreadyRunning | SessionError::NotRunning => ErrorKind::Internal,
            SessionError::Credential(e) if e.is_rate_limited() => ErrorKind::RateLimit,
            SessionError::Credential(_) => ErrorKind::Credential,
            SessionError::Transport(e) => e.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::AlreadyRunning | SessionError::NotRunning => false,
            SessionError::Credential(e) => e.is_retryable(),
            SessionError::Transport(e) => e.is_retryable(),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
