use thiserror::Error;

/// Metrics persistence errors
#[derive(Error, Debug)]
pub enum MonitoringError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure
    #[error("Store error: {0}")]
    Store(String),
}

/// Result type for monitoring operations
pub type MonitoringResult<T> = Result<T, MonitoringError>;
