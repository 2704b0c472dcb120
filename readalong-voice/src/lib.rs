//! Realtime voice session layer for the ReadAlong reading platform
//!
//! Streams a child's microphone audio to a realtime speech model and plays
//! the tutor's replies back, over either a direct peer session or a
//! WebSocket relayed through [`relay`].

/// Audio capture, conversion and playback
pub mod audio;

/// Ephemeral credential issuance
pub mod credentials;

/// Session telemetry
pub mod monitoring;

/// Provider protocol and WebSocket plumbing
pub mod network;

/// Languages, personas and voice profiles
pub mod profile;

/// Fixed-schedule reconnection
pub mod reconnect;

/// Server-side relay bridge
pub mod relay;

/// Session orchestration
pub mod session;

/// Connection state machine and configuration
pub mod state;

/// Peer and relayed transports
pub mod transport;

/// Utility modules
pub mod utils;
