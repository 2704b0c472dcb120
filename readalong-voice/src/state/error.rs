use thiserror::Error;

use super::connection_state::ConnectionState;

/// Connection state errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    /// The edge is not part of the declared transition table
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// A state name could not be parsed
    #[error("Unknown connection state: {0}")]
    UnknownState(String),

    /// Listener was already removed or never registered
    #[error("Listener with id {0} not found")]
    ListenerNotFound(u64),
}

/// Result type for the state module
pub type StateResult<T> = Result<T, StateError>;
