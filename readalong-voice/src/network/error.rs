/// Network error types for realtime websocket communication
use thiserror::Error;

/// Network-related errors
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Failed to connect to server
    #[error("Failed to connect to server: {0}")]
    ConnectionFailed(String),

    /// Credential or API key rejected (HTTP 401/403 on upgrade)
    #[error("Authentication failed: credential rejected")]
    AuthenticationFailed,

    /// Upgrade answered with an unexpected HTTP status
    #[error("Unexpected HTTP status {status} on upgrade")]
    UnexpectedStatus { status: u16 },

    /// WebSocket protocol error
    #[error("WebSocket protocol error: {0}")]
    ProtocolError(String),

    /// Connection timeout
    #[error("Connection timeout after {0}ms")]
    Timeout(u64),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    /// Failed to (de)serialize a message
    #[error("Failed to serialize message: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Failed to build HTTP request
    #[error("Failed to build HTTP request: {0}")]
    HttpError(String),

    /// Connection closed unexpectedly
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NetworkError {
    /// Whether opening a new connection could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            NetworkError::AuthenticationFailed | NetworkError::InvalidConfig(_)
        )
    }
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<tokio_tungstenite::tungstenite::http::Error> for NetworkError {
    fn from(err: tokio_tungstenite::tungstenite::http::Error) -> Self {
        NetworkError::HttpError(err.to_string())
    }
}
