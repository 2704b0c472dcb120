//! Server-side relay bridge
//!
//! Terminates client sockets from the relayed transport and bridges each one
//! to its own upstream provider socket:
//!
//! - `server` - axum router, upgrade validation, inactivity sweep
//! - `bridge` - per-connection forwarding loop and teardown
//! - `batching` - 50ms audio delta batching
//! - `usage` - token and cost estimates
//! - `registry` - live connection table owned by the server

pub mod batching;
pub mod bridge;
pub mod error;
pub mod registry;
pub mod server;
pub mod usage;

pub use batching::AudioBatcher;
pub use bridge::{BridgeEnd, BridgeTiming};
pub use error::{RelayError, RelayResult};
pub use registry::{ConnectionRegistry, RelayConnectionInfo};
pub use server::{RelayHandle, RelayQuery, RelayServer, RelaySession, resolve_query, sweep_inactive};
pub use usage::{TOKENS_PER_SECOND, UsageSummary, UsageTracker, estimate_tokens};
