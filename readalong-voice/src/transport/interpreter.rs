//! Provider event interpretation
//!
//! Both transports receive the same provider events and must react to them
//! identically; this module owns that translation. It reports to the
//! listener, advances the state machine through `session_created` and
//! `ready`, and tells the owning transport what to do with audio.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::chunk::AudioDirection;
use crate::network::protocol::{InboundFrame, ServerEvent};
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::transport::client::TransportListener;
use crate::transport::error::TransportError;

/// Consecutive malformed frames tolerated before the link is declared broken
pub const MAX_CONSECUTIVE_MALFORMED: u32 = 5;

/// What the transport must do after an event was interpreted
#[derive(Debug)]
pub enum Action {
    None,
    /// Decode and queue this base64 PCM16 payload for playback
    PlayAudio { item_id: String, delta: String },
    /// The provider finished sending audio for the current response
    AudioFinished,
    /// The user started talking; queued tutor audio must be dropped
    BargeIn,
    /// The link cannot continue
    Fatal(TransportError),
}

pub struct EventInterpreter {
    listener: Arc<dyn TransportListener>,
    state: Arc<ConnectionStateMachine>,
    ai_speaking: AtomicBool,
    response_completed: AtomicBool,
    turn_ended_at: Mutex<Option<Instant>>,
    consecutive_malformed: AtomicU32,
}

impl EventInterpreter {
    pub fn new(listener: Arc<dyn TransportListener>, state: Arc<ConnectionStateMachine>) -> Self {
        Self {
            listener,
            state,
            ai_speaking: AtomicBool::new(false),
            response_completed: AtomicBool::new(true),
            turn_ended_at: Mutex::new(None),
            consecutive_malformed: AtomicU32::new(0),
        }
    }

    /// Whether tutor audio for the current response is still arriving
    pub fn is_ai_speaking(&self) -> bool {
        self.ai_speaking.load(Ordering::SeqCst)
    }

    /// Start the latency clock; the next audio delta stops it
    pub fn mark_turn_end(&self) {
        *self.turn_ended_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
    }

    pub fn handle_frame(&self, frame: InboundFrame) -> Action {
        match frame {
            InboundFrame::Event(event) => {
                self.consecutive_malformed.store(0, Ordering::SeqCst);
                self.handle_event(event)
            }
            InboundFrame::Malformed(reason) => {
                let count = self.consecutive_malformed.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(count, reason = %reason, "Malformed provider frame");
                if count >= MAX_CONSECUTIVE_MALFORMED {
                    let error = TransportError::Protocol(format!(
                        "{count} consecutive malformed frames, last: {reason}"
                    ));
                    self.listener.on_error(&error);
                    Action::Fatal(error)
                } else {
                    Action::None
                }
            }
        }
    }

    pub fn handle_event(&self, event: ServerEvent) -> Action {
        if !event.is_audio_delta() {
            debug!(event = event.event_type(), "Provider event");
        }

        match event {
            ServerEvent::SessionCreated { session } => {
                info!(session_id = %session.id, model = %session.model, "Provider session created");
                if self.state.state() == ConnectionState::TransportOpen {
                    self.state.transition(ConnectionState::SessionCreated);
                }
                Action::None
            }
            ServerEvent::SessionUpdated { session } => {
                debug!(voice = ?session.voice, "Provider session updated");
                if self.state.state() == ConnectionState::SessionCreated {
                    self.state.transition(ConnectionState::Ready);
                }
                Action::None
            }
            ServerEvent::AudioDelta { item_id, delta, .. } => {
                if !self.ai_speaking.swap(true, Ordering::SeqCst) {
                    self.response_completed.store(false, Ordering::SeqCst);
                    let started = self
                        .turn_ended_at
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .take();
                    if let Some(started) = started {
                        let latency_ms = started.elapsed().as_millis() as u64;
                        debug!(latency_ms, "First audio of response");
                        self.listener.on_latency_update(latency_ms);
                    }
                }
                self.listener.on_audio_chunk(AudioDirection::Inbound);
                Action::PlayAudio { item_id, delta }
            }
            ServerEvent::AudioDone { .. } => {
                self.ai_speaking.store(false, Ordering::SeqCst);
                self.complete_response();
                Action::AudioFinished
            }
            ServerEvent::TranscriptDelta { item_id, delta } => {
                self.listener.on_agent_transcript(&item_id, &delta, false);
                self.listener.on_transcription(&delta, false);
                Action::None
            }
            ServerEvent::TranscriptDone { item_id, transcript } => {
                self.listener.on_agent_transcript(&item_id, &transcript, true);
                self.listener.on_transcription(&transcript, false);
                Action::None
            }
            ServerEvent::InputTranscriptionCompleted { transcript, .. } => {
                self.listener.on_transcription(&transcript, true);
                Action::None
            }
            ServerEvent::SpeechStarted { audio_start_ms } => {
                debug!(?audio_start_ms, "User speech started");
                Action::BargeIn
            }
            ServerEvent::SpeechStopped { audio_end_ms } => {
                debug!(?audio_end_ms, "User speech stopped");
                self.mark_turn_end();
                Action::None
            }
            ServerEvent::ResponseCreated { response } => {
                debug!(response_id = %response.id, "Response started");
                self.response_completed.store(false, Ordering::SeqCst);
                Action::None
            }
            ServerEvent::ResponseDone { response } => {
                debug!(response_id = %response.id, status = ?response.status, "Response finished");
                let was_speaking = self.ai_speaking.swap(false, Ordering::SeqCst);
                self.complete_response();
                if was_speaking {
                    Action::AudioFinished
                } else {
                    Action::None
                }
            }
            ServerEvent::Error { error } => {
                let classified = TransportError::from_provider(&error);
                warn!(
                    error_type = %error.error_type,
                    code = ?error.code,
                    message = %error.message,
                    "Provider error"
                );
                self.listener.on_error(&classified);
                if classified.is_fatal() {
                    Action::Fatal(classified)
                } else {
                    Action::None
                }
            }
            ServerEvent::InputAudioCommitted { .. }
            | ServerEvent::RateLimitsUpdated { .. }
            | ServerEvent::Unknown => Action::None,
        }
    }

    fn complete_response(&self) {
        if !self.response_completed.swap(true, Ordering::SeqCst) {
            self.listener.on_response_complete();
        }
    }
}
