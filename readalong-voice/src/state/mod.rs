//! Connection lifecycle state and configuration
//!
//! - `connection_state` - the connection finite-state machine
//! - `config` - voice layer configuration
//! - `error` - state machine errors

pub mod config;
mod connection_state;
mod error;

pub use config::{AppConfig, ConfigError, ConfigManager, ConfigResult, GlobalConfig};
pub use connection_state::{
    ConnectionState, ConnectionStateMachine, ListenerId, MAX_STATE_HISTORY, StateRecord,
};
pub use error::{StateError, StateResult};
