//! Ephemeral credential issuance
//!
//! A credential authorizes exactly one realtime session and is bound at
//! issuance to the session's voice, localized instructions and VAD tuning.

/// Remote issuer client
pub mod client;

/// Credential error types
pub mod error;

/// Issuance endpoint
pub mod http;

/// Issuer trait and service
pub mod issuer;

/// Secret minting backends
pub mod minter;

/// Per-caller sliding window
pub mod rate_limit;

mod types;

pub use client::RemoteCredentialIssuer;
pub use error::{CredentialError, CredentialErrorCode, CredentialResult, ErrorBody};
pub use http::credential_routes;
pub use issuer::{ANONYMOUS_CALLER, CredentialIssuer, EphemeralCredentialService};
pub use minter::{CredentialMinter, HttpCredentialMinter, MintedSecret, OpaqueTokenMinter};
pub use rate_limit::SlidingWindowLimiter;
pub use types::{CredentialRequest, EphemeralCredential};
