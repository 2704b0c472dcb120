//! Realtime socket plumbing
//!
//! Types and tasks shared by the relayed transport and the relay bridge
//! for speaking the provider's JSON event protocol over WebSocket.

/// WebSocket connection management
pub mod connection;

/// Network error types
pub mod error;

/// Provider event types
pub mod protocol;

/// Async tasks for concurrent send/receive operations
pub mod tasks;

// Re-export commonly used types
pub use connection::{ConnectionConfig, RealtimeConnection, WsReader, WsWriter};
pub use error::{NetworkError, NetworkResult};
pub use protocol::{ClientEvent, FrameKind, InboundFrame, ServerEvent, SessionSettings};
