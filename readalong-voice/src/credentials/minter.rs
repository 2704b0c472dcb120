//! Secret minting backends
//!
//! The issuer decides who gets a credential; a minter produces the secret
//! itself. Production mints provider client secrets over HTTPS, tests and
//! offline deployments mint opaque local tokens.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::credentials::error::{CredentialError, CredentialResult};
use crate::network::protocol::SessionSettings;
use crate::profile::VoiceProfile;
use crate::state::config::ProviderConfig;

/// Default lifetime of locally minted tokens
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 60;

/// A freshly minted secret
#[derive(Debug, Clone, PartialEq)]
pub struct MintedSecret {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CredentialMinter: Send + Sync {
    /// Mint a secret pre-bound to `profile`
    async fn mint(&self, profile: &VoiceProfile) -> CredentialResult<MintedSecret>;

    /// Model the secret is valid for
    fn model(&self) -> &str;
}

#[derive(Serialize)]
struct MintRequest<'a> {
    model: &'a str,
    #[serde(flatten)]
    session: SessionSettings,
}

#[derive(Deserialize)]
struct MintResponse {
    client_secret: ClientSecret,
}

#[derive(Deserialize)]
struct ClientSecret {
    value: String,
    /// Unix seconds
    expires_at: i64,
}

/// Mints provider client secrets through the sessions endpoint
pub struct HttpCredentialMinter {
    client: reqwest::Client,
    provider: ProviderConfig,
    temperature: f32,
    max_response_output_tokens: u32,
}

impl HttpCredentialMinter {
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider,
            temperature: 0.8,
            max_response_output_tokens: 4096,
        }
    }

    pub fn with_generation(mut self, temperature: f32, max_response_output_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_response_output_tokens = max_response_output_tokens;
        self
    }
}

#[async_trait]
impl CredentialMinter for HttpCredentialMinter {
    async fn mint(&self, profile: &VoiceProfile) -> CredentialResult<MintedSecret> {
        let body = MintRequest {
            model: &self.provider.model,
            session: SessionSettings::bootstrap(
                profile,
                &self.provider.transcription_model,
                self.temperature,
                self.max_response_output_tokens,
            ),
        };

        let response = self
            .client
            .post(&self.provider.sessions_url)
            .bearer_auth(&self.provider.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CredentialError::Upstream(format!("Network error minting secret: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Provider refused to mint secret");
            return Err(CredentialError::Upstream(match status.as_u16() {
                401 | 403 => "Provider rejected the server API key".to_string(),
                429 => "Provider rate limited secret minting".to_string(),
                _ => format!("Provider error {status}: {text}"),
            }));
        }

        let parsed: MintResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Upstream(format!("Failed to parse mint response: {e}")))?;

        let expires_at = Utc
            .timestamp_opt(parsed.client_secret.expires_at, 0)
            .single()
            .ok_or_else(|| {
                CredentialError::Upstream(format!(
                    "Invalid expiry timestamp: {}",
                    parsed.client_secret.expires_at
                ))
            })?;

        debug!(voice = %profile.voice, %expires_at, "Minted provider client secret");

        Ok(MintedSecret {
            value: parsed.client_secret.value,
            expires_at,
        })
    }

    fn model(&self) -> &str {
        &self.provider.model
    }
}

/// Mints random `ek_` tokens without calling the provider
///
/// Used when the relay terminates provider auth itself (no API key is
/// handed to clients), and in tests.
pub struct OpaqueTokenMinter {
    model: String,
    ttl: Duration,
}

impl OpaqueTokenMinter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl CredentialMinter for OpaqueTokenMinter {
    async fn mint(&self, _profile: &VoiceProfile) -> CredentialResult<MintedSecret> {
        Ok(MintedSecret {
            value: format!("ek_{}", uuid::Uuid::new_v4().simple()),
            expires_at: Utc::now() + self.ttl,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}
