//! Realtime provider protocol events
//!
//! Both transports and the relay speak the same JSON event protocol:
//!
//! 1. The channel opens and the provider sends `session.created`
//! 2. The client (or relay) sends `session.update`; provider acks with `session.updated`
//! 3. Microphone audio streams as `input_audio_buffer.append`
//! 4. Replies stream back as `response.audio.delta` / `response.audio_transcript.delta`
//! 5. `response.audio.done` and `response.done` close each response
//!
//! Audio payloads are base64 PCM16 mono at [`REALTIME_SAMPLE_RATE`].

use serde::{Deserialize, Serialize};

use crate::audio::pcm;
use crate::profile::{TurnDetection, VoiceProfile};

/// Wire sample rate for all audio payloads
pub const REALTIME_SAMPLE_RATE: u32 = 24_000;

/// Audio format name used in session configuration
pub const PCM16_FORMAT: &str = "pcm16";

/// Session configuration carried by `session.update`
///
/// Every field is optional so partial updates (e.g. only turn detection)
/// serialize without clobbering server defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,
}

impl SessionSettings {
    /// Full bootstrap sent when a session is opened
    pub fn bootstrap(
        profile: &VoiceProfile,
        transcription_model: &str,
        temperature: f32,
        max_response_output_tokens: u32,
    ) -> Self {
        Self {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            voice: Some(profile.voice.clone()),
            instructions: Some(profile.instructions.clone()),
            input_audio_format: Some(PCM16_FORMAT.to_string()),
            output_audio_format: Some(PCM16_FORMAT.to_string()),
            input_audio_transcription: Some(TranscriptionSettings {
                model: transcription_model.to_string(),
            }),
            turn_detection: Some(profile.turn_detection.clone()),
            temperature: Some(temperature),
            max_response_output_tokens: Some(max_response_output_tokens),
        }
    }

    /// Update carrying only turn-detection parameters
    pub fn turn_detection_only(turn_detection: TurnDetection) -> Self {
        Self {
            turn_detection: Some(turn_detection),
            ..Default::default()
        }
    }
}

/// Input transcription model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    pub model: String,
}

/// Conversation item created by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// A user message carrying plain text
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            role: "user".to_string(),
            content: vec![ContentPart {
                kind: "input_text".to_string(),
                text: text.into(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

// ============================================================================
// Client -> Provider
// ============================================================================

/// Events sent to the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    /// Base64 PCM16 audio
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    AudioCommit,

    #[serde(rename = "input_audio_buffer.clear")]
    AudioClear,

    #[serde(rename = "conversation.item.create")]
    ItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// Append raw PCM16 samples
    pub fn audio_append(samples: &[i16]) -> Self {
        Self::AudioAppend {
            audio: pcm::encode_samples(samples),
        }
    }

    /// The two events that make up `send_text`: the item, then a response request
    pub fn text_message(text: impl Into<String>) -> [Self; 2] {
        [
            Self::ItemCreate {
                item: ConversationItem::user_text(text),
            },
            Self::ResponseCreate,
        ]
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::AudioAppend { .. } => "input_audio_buffer.append",
            Self::AudioCommit => "input_audio_buffer.commit",
            Self::AudioClear => "input_audio_buffer.clear",
            Self::ItemCreate { .. } => "conversation.item.create",
            Self::ResponseCreate => "response.create",
            Self::ResponseCancel => "response.cancel",
        }
    }
}

// ============================================================================
// Provider -> Client
// ============================================================================

/// Session details echoed by the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionInfo {
    pub id: String,
    pub model: String,
    pub voice: Option<String>,
}

/// Response envelope on `response.created` / `response.done`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseInfo {
    pub id: String,
    pub status: Option<String>,
}

/// Error payload from the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: Option<String>,
    pub message: String,
    pub param: Option<String>,
}

/// Events received from the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: SessionInfo,
    },

    /// Base64 PCM16 audio for the current response
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta {
        #[serde(default)]
        item_id: String,
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        transcript: String,
    },

    /// Final transcription of what the user said
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        item_id: String,
        transcript: String,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
    },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: Option<u64>,
    },

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated {
        #[serde(default)]
        rate_limits: Vec<serde_json::Value>,
    },

    #[serde(rename = "error")]
    Error { error: ProviderError },

    /// Anything not modelled above; logged and skipped
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn is_audio_delta(&self) -> bool {
        matches!(self, Self::AudioDelta { .. })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::AudioDelta { .. } => "response.audio.delta",
            Self::AudioDone { .. } => "response.audio.done",
            Self::TranscriptDelta { .. } => "response.audio_transcript.delta",
            Self::TranscriptDone { .. } => "response.audio_transcript.done",
            Self::InputTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            Self::SpeechStarted { .. } => "input_audio_buffer.speech_started",
            Self::SpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            Self::InputAudioCommitted { .. } => "input_audio_buffer.committed",
            Self::ResponseCreated { .. } => "response.created",
            Self::ResponseDone { .. } => "response.done",
            Self::RateLimitsUpdated { .. } => "rate_limits.updated",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// A provider text frame after decoding
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Event(ServerEvent),
    /// Not valid JSON, or a known event with a missing field
    Malformed(String),
}

impl InboundFrame {
    pub fn decode(text: &str) -> Self {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => InboundFrame::Event(event),
            Err(e) => InboundFrame::Malformed(e.to_string()),
        }
    }
}

/// Coarse classification of a raw provider frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `response.audio.delta`; eligible for batching
    AudioDelta,
    /// `response.audio.done` or `response.done`; pending audio must go first
    AudioTerminator,
    /// Everything else, including frames that are not JSON
    Other,
}

#[derive(Deserialize)]
struct TypePeek {
    #[serde(rename = "type", default)]
    kind: String,
}

/// Peek at a frame's `type` without decoding the whole event
pub fn classify_frame(text: &str) -> FrameKind {
    match serde_json::from_str::<TypePeek>(text) {
        Ok(peek) => match peek.kind.as_str() {
            "response.audio.delta" => FrameKind::AudioDelta,
            "response.audio.done" | "response.done" => FrameKind::AudioTerminator,
            _ => FrameKind::Other,
        },
        Err(_) => FrameKind::Other,
    }
}
