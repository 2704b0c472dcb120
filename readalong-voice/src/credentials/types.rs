use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::{Language, Persona, SessionMetadata, TurnDetection};

/// Body of `POST /credentials`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRequest {
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_metadata: Option<SessionMetadata>,
}

impl CredentialRequest {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            caller_id: None,
            session_metadata: None,
        }
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: SessionMetadata) -> Self {
        self.session_metadata = Some(metadata);
        self
    }
}

/// A single-use bearer credential bound to one session's voice profile
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralCredential {
    pub credential: String,
    pub session_id: String,
    pub language: Language,
    pub persona: Persona,
    pub voice: String,
    pub model: String,
    pub expires_at: DateTime<Utc>,
    pub instructions: String,
    pub turn_detection: TurnDetection,
}

impl EphemeralCredential {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl fmt::Debug for EphemeralCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralCredential")
            .field("credential", &"<redacted>")
            .field("session_id", &self.session_id)
            .field("language", &self.language)
            .field("persona", &self.persona)
            .field("voice", &self.voice)
            .field("model", &self.model)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
