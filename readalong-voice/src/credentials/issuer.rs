use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::credentials::error::{CredentialError, CredentialResult};
use crate::credentials::minter::CredentialMinter;
use crate::credentials::rate_limit::SlidingWindowLimiter;
use crate::credentials::types::{CredentialRequest, EphemeralCredential};
use crate::profile::{Language, VoiceProfile};
use crate::state::config::CredentialsConfig;

/// Rate-limit bucket shared by callers that do not identify themselves
pub const ANONYMOUS_CALLER: &str = "anonymous";

/// Issues single-use session credentials
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, request: CredentialRequest) -> CredentialResult<EphemeralCredential>;
}

struct IssuedEntry {
    credential: EphemeralCredential,
    consumed: bool,
}

/// Credential issuer with per-caller sliding-window limits
///
/// Every issued credential is remembered until it expires so the relay can
/// bind it to exactly one connection through [`consume`](Self::consume).
pub struct EphemeralCredentialService {
    minter: Arc<dyn CredentialMinter>,
    limiter: SlidingWindowLimiter,
    issued: Mutex<HashMap<String, IssuedEntry>>,
}

impl EphemeralCredentialService {
    pub fn new(minter: Arc<dyn CredentialMinter>, config: &CredentialsConfig) -> Self {
        Self {
            minter,
            limiter: SlidingWindowLimiter::new(config.max_requests, config.window()),
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `credential` to a connection
    ///
    /// Succeeds once per credential. Unknown and expired credentials are
    /// rejected as invalid; a second use returns `AlreadyConsumed`.
    pub fn consume(&self, credential: &str) -> CredentialResult<EphemeralCredential> {
        let mut issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());

        let entry = issued
            .get_mut(credential)
            .ok_or_else(|| CredentialError::InvalidRequest("Unknown credential".to_string()))?;

        if entry.consumed {
            warn!(session_id = %entry.credential.session_id, "Credential reuse rejected");
            return Err(CredentialError::AlreadyConsumed(
                entry.credential.session_id.clone(),
            ));
        }
        if entry.credential.is_expired() {
            return Err(CredentialError::InvalidRequest(
                "Credential has expired".to_string(),
            ));
        }

        entry.consumed = true;
        debug!(session_id = %entry.credential.session_id, "Credential consumed");
        Ok(entry.credential.clone())
    }

    /// Credentials issued and not yet expired
    pub fn outstanding(&self) -> usize {
        self.issued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|e| !e.consumed && !e.credential.is_expired())
            .count()
    }

    fn prune_expired(&self) {
        let now = Utc::now();
        let mut issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
        issued.retain(|_, e| e.credential.expires_at > now);
        drop(issued);
        self.limiter.prune();
    }
}

#[async_trait]
impl CredentialIssuer for EphemeralCredentialService {
    async fn issue(&self, request: CredentialRequest) -> CredentialResult<EphemeralCredential> {
        if request.language.trim().is_empty() {
            return Err(CredentialError::InvalidRequest(
                "language is required".to_string(),
            ));
        }

        let language: Language = request
            .language
            .parse()
            .map_err(|_| CredentialError::InvalidLanguage(request.language.clone()))?;

        let caller_id = request
            .caller_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(ANONYMOUS_CALLER)
            .to_string();

        if let Err(retry_after) = self.limiter.check(&caller_id) {
            warn!(caller_id = %caller_id, retry_after_secs = retry_after.as_secs(), "Credential rate limit exceeded");
            return Err(CredentialError::RateLimitExceeded {
                caller_id,
                retry_after,
            });
        }

        let metadata = request.session_metadata.unwrap_or_default();
        let profile = VoiceProfile::resolve(language, &metadata);
        let secret = self.minter.mint(&profile).await?;

        let credential = EphemeralCredential {
            credential: secret.value,
            session_id: uuid::Uuid::new_v4().to_string(),
            language,
            persona: profile.persona,
            voice: profile.voice,
            model: self.minter.model().to_string(),
            expires_at: secret.expires_at,
            instructions: profile.instructions,
            turn_detection: profile.turn_detection,
        };

        self.prune_expired();
        self.issued.lock().unwrap_or_else(|p| p.into_inner()).insert(
            credential.credential.clone(),
            IssuedEntry {
                credential: credential.clone(),
                consumed: false,
            },
        );

        info!(
            session_id = %credential.session_id,
            caller_id = %caller_id,
            language = %language,
            voice = %credential.voice,
            "Issued ephemeral credential"
        );
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::minter::OpaqueTokenMinter;
    use crate::profile::SessionMetadata;

    fn service() -> EphemeralCredentialService {
        EphemeralCredentialService::new(
            Arc::new(OpaqueTokenMinter::new("gpt-4o-realtime-preview")),
            &CredentialsConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_issue_binds_profile() {
        let service = service();
        let metadata = SessionMetadata {
            grade: Some(1),
            ..Default::default()
        };
        let credential = service
            .issue(
                CredentialRequest::new("es-MX")
                    .with_caller("s1")
                    .with_metadata(metadata),
            )
            .await
            .unwrap();

        assert_eq!(credential.language, Language::Spanish);
        assert_eq!(credential.voice, "coral");
        assert!(credential.instructions.contains("español"));
        assert_eq!(credential.turn_detection.silence_duration_ms, 1300);
        assert_eq!(service.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let service = service();

        let err = service.issue(CredentialRequest::new("")).await.unwrap_err();
        assert!(matches!(err, CredentialError::InvalidRequest(_)));

        let err = service.issue(CredentialRequest::new("fr")).await.unwrap_err();
        assert_eq!(err, CredentialError::InvalidLanguage("fr".to_string()));
    }

    #[tokio::test]
    async fn test_credential_single_use() {
        let service = service();
        let credential = service.issue(CredentialRequest::new("en")).await.unwrap();

        let bound = service.consume(&credential.credential).unwrap();
        assert_eq!(bound.session_id, credential.session_id);

        assert!(matches!(
            service.consume(&credential.credential),
            Err(CredentialError::AlreadyConsumed(_))
        ));
        assert!(matches!(
            service.consume("ek_unknown"),
            Err(CredentialError::InvalidRequest(_))
        ));
        assert_eq!(service.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_expired_credential_rejected() {
        let service = EphemeralCredentialService::new(
            Arc::new(
                OpaqueTokenMinter::new("gpt-4o-realtime-preview")
                    .with_ttl(chrono::Duration::seconds(-1)),
            ),
            &CredentialsConfig::default(),
        );
        let credential = service.issue(CredentialRequest::new("en")).await.unwrap();

        assert!(matches!(
            service.consume(&credential.credential),
            Err(CredentialError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_anonymous_callers_share_bucket() {
        let service = EphemeralCredentialService::new(
            Arc::new(OpaqueTokenMinter::new("m")),
            &CredentialsConfig {
                max_requests: 2,
                window_secs: 60,
            },
        );

        service.issue(CredentialRequest::new("en")).await.unwrap();
        service
            .issue(CredentialRequest::new("en").with_caller("  "))
            .await
            .unwrap();
        let err = service.issue(CredentialRequest::new("en")).await.unwrap_err();
        assert!(err.is_rate_limited());

        service
            .issue(CredentialRequest::new("en").with_caller("s2"))
            .await
            .unwrap();
    }
}
