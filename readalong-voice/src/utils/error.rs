//! Application-wide error handling
//!
//! Provides a unified error type with user-facing messages.
//!
//! # Features
//!
//! - `AppError` aggregates every module error
//! - [`ErrorKind`] places an error in the voice layer's taxonomy
//! - [`ErrorCode`] lets the client UI react to specific failures
//! - Recovery hints for errors the user can fix
//!
//! # Example
//!
//! ```
//! use readalong_voice_lib::utils::error::{AppError, ErrorKind};
//!
//! let err = AppError::Timeout(5000);
//! assert_eq!(err.kind(), ErrorKind::Transport);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::error::AudioError;
use crate::credentials::CredentialError;
use crate::monitoring::MonitoringError;
use crate::network::error::NetworkError;
use crate::session::SessionError;
use crate::state::StateError;
use crate::state::config::ConfigError;
use crate::transport::TransportError;

/// Error taxonomy shared by transports, sessions and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credential missing, rejected or expired
    Credential,
    /// Link could not be opened or dropped
    Transport,
    /// Malformed or unexpected frames
    Protocol,
    /// Explicit error from the realtime provider
    Provider,
    /// Microphone or device unavailable
    Resource,
    /// Too many credential requests
    RateLimit,
    Internal,
}

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Monitoring error: {0}")]
    Monitoring(#[from] MonitoringError),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Operation cancelled by the user
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),
}

/// Error codes
///
/// Used by the client UI to identify specific failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Audio
    AudioDeviceNotFound,
    AudioPermissionDenied,
    AudioStreamError,
    AudioResampleFailed,

    // Network
    NetworkConnectionFailed,
    NetworkAuthFailed,
    NetworkProtocolError,
    NetworkTimeout,

    // Credentials
    CredentialInvalid,
    CredentialRateLimited,
    CredentialUpstream,

    // Transport
    TransportNegotiationFailed,
    TransportConnectionLost,
    ProviderError,
    ProtocolError,

    // Config
    ConfigLoadFailed,
    ConfigInvalid,

    // Session
    SessionAlreadyRunning,
    SessionNotRunning,

    MonitoringWriteFailed,

    // General
    InternalError,
    OperationCancelled,
    OperationTimeout,
}

/// Error context
///
/// User-facing message plus recovery hint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub code: ErrorCode,
    pub kind: ErrorKind,
    /// Message suitable for display
    pub message: String,
    /// Full error text for logs
    pub detail: Option<String>,
    pub recovery_hint: Option<String>,
    pub recoverable: bool,
}

impl ErrorContext {
    pub fn new(code: ErrorCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
            detail: None,
            recovery_hint: None,
            recoverable: true,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_recovery_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }

    /// Mark as not recoverable
    pub fn not_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

impl AppError {
    /// Position in the error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Audio(e) if e.is_resource_error() => ErrorKind::Resource,
            AppError::Audio(_) => ErrorKind::Transport,
            AppError::Network(NetworkError::AuthenticationFailed) => ErrorKind::Credential,
            AppError::Network(NetworkError::ProtocolError(_)) => ErrorKind::Protocol,
            AppError::Network(_) => ErrorKind::Transport,
            AppError::Credential(e) if e.is_rate_limited() => ErrorKind::RateLimit,
            AppError::Credential(_) => ErrorKind::Credential,
            AppError::Transport(e) => e.kind(),
            AppError::Session(e) => e.kind(),
            AppError::Timeout(_) => ErrorKind::Transport,
            AppError::Config(_)
            | AppError::State(_)
            | AppError::Monitoring(_)
            | AppError::Internal(_)
            | AppError::Cancelled => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Audio(AudioError::DeviceNotFound) => ErrorCode::AudioDeviceNotFound,
            AppError::Audio(AudioError::PermissionDenied(_)) => ErrorCode::AudioPermissionDenied,
            AppError::Audio(AudioError::ResampleFailed(_)) => ErrorCode::AudioResampleFailed,
            AppError::Audio(_) => ErrorCode::AudioStreamError,

            AppError::Network(NetworkError::AuthenticationFailed) => ErrorCode::NetworkAuthFailed,
            AppError::Network(NetworkError::ProtocolError(_)) => ErrorCode::NetworkProtocolError,
            AppError::Network(NetworkError::Timeout(_)) => ErrorCode::NetworkTimeout,
            AppError::Network(_) => ErrorCode::NetworkConnectionFailed,

            AppError::Config(ConfigError::Json(_) | ConfigError::Invalid(_)) => {
                ErrorCode::ConfigInvalid
            }
            AppError::Config(_) => ErrorCode::ConfigLoadFailed,

            AppError::Credential(e) => credential_code(e),
            AppError::Transport(e) => transport_code(e),

            AppError::Session(SessionError::AlreadyRunning) => ErrorCode::SessionAlreadyRunning,
            AppError::Session(SessionError::NotRunning) => ErrorCode::SessionNotRunning,
            AppError::Session(SessionError::Credential(e)) => credential_code(e),
            AppError::Session(SessionError::Transport(e)) => transport_code(e),

            AppError::Monitoring(_) => ErrorCode::MonitoringWriteFailed,
            AppError::State(_) | AppError::Internal(_) => ErrorCode::InternalError,
            AppError::Cancelled => ErrorCode::OperationCancelled,
            AppError::Timeout(_) => ErrorCode::OperationTimeout,
        }
    }

    /// Message suitable for showing to a grown-up
    pub fn user_message(&self) -> String {
        match self.code() {
            ErrorCode::AudioDeviceNotFound => {
                "No microphone was found. Check that one is plugged in.".to_string()
            }
            ErrorCode::AudioPermissionDenied => {
                "The microphone is blocked. Allow microphone access to talk with your tutor."
                    .to_string()
            }
            ErrorCode::AudioStreamError | ErrorCode::AudioResampleFailed => {
                "Something went wrong with the audio. Please try again.".to_string()
            }
            ErrorCode::NetworkConnectionFailed | ErrorCode::TransportConnectionLost => {
                "The connection to your tutor was lost. Please try again.".to_string()
            }
            ErrorCode::NetworkAuthFailed | ErrorCode::CredentialInvalid => {
                "This session could not be authorized. Please start a new one.".to_string()
            }
            ErrorCode::NetworkTimeout | ErrorCode::OperationTimeout => {
                "Your tutor is taking too long to answer. Please try again.".to_string()
            }
            ErrorCode::CredentialRateLimited => {
                "Too many sessions were started. Please wait a minute.".to_string()
            }
            ErrorCode::CredentialUpstream | ErrorCode::ProviderError => {
                "The voice service is having trouble right now.".to_string()
            }
            ErrorCode::TransportNegotiationFailed
            | ErrorCode::NetworkProtocolError
            | ErrorCode::ProtocolError => {
                "Could not talk to the voice service. Please try again.".to_string()
            }
            ErrorCode::ConfigLoadFailed | ErrorCode::ConfigInvalid => {
                "The voice settings could not be loaded.".to_string()
            }
            ErrorCode::SessionAlreadyRunning => "A session is already running.".to_string(),
            ErrorCode::SessionNotRunning => "No session is running.".to_string(),
            ErrorCode::MonitoringWriteFailed => "Session metrics could not be saved.".to_string(),
            ErrorCode::OperationCancelled => "Cancelled.".to_string(),
            ErrorCode::InternalError => format!("Internal error: {self}"),
        }
    }

    /// Full error context
    pub fn context(&self) -> ErrorContext {
        let mut ctx = ErrorContext::new(self.code(), self.kind(), self.user_message())
            .with_detail(self.to_string());
        ctx.recovery_hint = self.recovery_hint();

        if !self.is_recoverable() {
            ctx = ctx.not_recoverable();
        }
        ctx
    }

    pub fn recovery_hint(&self) -> Option<String> {
        match self.kind() {
            ErrorKind::Resource => Some(
                "Open the browser or system settings and allow microphone access for ReadAlong"
                    .to_string(),
            ),
            ErrorKind::RateLimit => Some("Wait a minute before starting another session".to_string()),
            ErrorKind::Transport => Some("Check the network connection, or retry shortly".to_string()),
            _ => None,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Config(_) | AppError::Internal(_) | AppError::State(_) => false,
            AppError::Transport(e) => !e.is_fatal() || e.is_retryable(),
            _ => true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Timeout(_))
    }

    pub fn is_auth_error(&self) -> bool {
        self.kind() == ErrorKind::Credential
    }

    pub fn is_permission_error(&self) -> bool {
        matches!(
            self,
            AppError::Audio(AudioError::PermissionDenied(_))
                | AppError::Transport(TransportError::Audio(AudioError::PermissionDenied(_)))
        )
    }
}

fn credential_code(error: &CredentialError) -> ErrorCode {
    match error {
        CredentialError::RateLimitExceeded { .. } => ErrorCode::CredentialRateLimited,
        CredentialError::Upstream(_) => ErrorCode::CredentialUpstream,
        CredentialError::Internal(_) => ErrorCode::InternalError,
        _ => ErrorCode::CredentialInvalid,
    }
}

fn transport_code(error: &TransportError) -> ErrorCode {
    match error {
        TransportError::Credential(e) => credential_code(e),
        TransportError::Network(NetworkError::AuthenticationFailed) => ErrorCode::NetworkAuthFailed,
        TransportError::Network(_) => ErrorCode::NetworkConnectionFailed,
        TransportError::Audio(AudioError::DeviceNotFound) => ErrorCode::AudioDeviceNotFound,
        TransportError::Audio(AudioError::PermissionDenied(_)) => ErrorCode::AudioPermissionDenied,
        TransportError::Audio(_) => ErrorCode::AudioStreamError,
        TransportError::Negotiation(_) => ErrorCode::TransportNegotiationFailed,
        TransportError::Provider { .. } => ErrorCode::ProviderError,
        TransportError::Protocol(_) => ErrorCode::ProtocolError,
        TransportError::Timeout(_) => ErrorCode::OperationTimeout,
        TransportError::ConnectionLost(_) => ErrorCode::TransportConnectionLost,
        TransportError::AlreadyConnected => ErrorCode::SessionAlreadyRunning,
        TransportError::NotConnected => ErrorCode::SessionNotRunning,
        TransportError::InvalidConfig(_) => ErrorCode::ConfigInvalid,
    }
}

/// Application result type
pub type AppResult<T> = Result<T, AppError>;

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Internal(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }
}
