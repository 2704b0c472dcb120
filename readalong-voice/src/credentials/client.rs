use async_trait::async_trait;
use tracing::debug;

use crate::credentials::error::{CredentialError, CredentialResult, ErrorBody};
use crate::credentials::issuer::CredentialIssuer;
use crate::credentials::types::{CredentialRequest, EphemeralCredential};

/// Client side of `POST /credentials`
///
/// Maps the `{error, code}` body back onto [`CredentialError`] so callers
/// branch on the same variants whether the issuer is local or remote.
pub struct RemoteCredentialIssuer {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteCredentialIssuer {
    /// `endpoint` is the full issuance URL, e.g. `http://host:8787/credentials`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CredentialIssuer for RemoteCredentialIssuer {
    async fn issue(&self, request: CredentialRequest) -> CredentialResult<EphemeralCredential> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| CredentialError::Upstream(format!("Credential endpoint unreachable: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| {
                CredentialError::Internal(format!("Failed to parse credential response: {e}"))
            });
        }

        let text = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "Credential request rejected");

        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(CredentialError::from_body(body)),
            Err(_) if status.is_server_error() => Err(CredentialError::Upstream(format!(
                "Credential endpoint error {status}: {text}"
            ))),
            Err(_) => Err(CredentialError::InvalidRequest(format!(
                "Credential endpoint returned {status}"
            ))),
        }
    }
}
