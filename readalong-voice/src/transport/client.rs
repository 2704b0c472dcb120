//! Transport contract shared by the peer and relayed implementations

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::audio::capture::{MicrophoneSource, ScriptedMicrophone};
use crate::audio::chunk::AudioDirection;
use crate::audio::playback::{AudioSink, PacedSink};
use crate::credentials::{ANONYMOUS_CALLER, EphemeralCredential};
use crate::network::protocol::REALTIME_SAMPLE_RATE;
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::transport::error::{TransportError, TransportResult};

/// Which transport a session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Direct media session with the provider (SDP offer/answer)
    Peer,
    /// WebSocket to the relay bridge
    #[default]
    Relayed,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Peer => f.write_str("peer"),
            TransportKind::Relayed => f.write_str("relayed"),
        }
    }
}

/// Receives transport events
///
/// A client holds exactly one listener, so each event type has at most one
/// handler. Callbacks run on the transport's tasks and must not block.
pub trait TransportListener: Send + Sync {
    /// `is_user` is true for the child's speech, false for the tutor's
    fn on_transcription(&self, _text: &str, _is_user: bool) {}

    /// Tutor transcript text for one conversation item; `is_final` marks the
    /// complete transcript, which supersedes the item's earlier deltas
    fn on_agent_transcript(&self, _item_id: &str, _text: &str, _is_final: bool) {}

    /// Tutor audio started or stopped playing
    fn on_audio_playback(&self, _playing: bool) {}

    /// Microphone level of the last captured frame
    fn on_audio_level(&self, _dbfs: f32) {}

    fn on_connection_change(&self, _connected: bool) {}

    fn on_error(&self, _error: &TransportError) {}

    /// Time from the end of a user turn to the first audio of the reply
    fn on_latency_update(&self, _latency_ms: u64) {}

    fn on_response_complete(&self) {}

    /// An audio chunk was sent or received
    fn on_audio_chunk(&self, _direction: AudioDirection) {}

    /// Playback drained while the reply was still streaming
    fn on_buffer_underrun(&self) {}
}

/// Listener that ignores everything
pub struct NoopListener;

impl TransportListener for NoopListener {}

/// A realtime voice transport
#[async_trait]
pub trait TransportClient: Send {
    fn kind(&self) -> TransportKind;

    /// Open the media/data path; resolves once the session is ready
    ///
    /// Fails with [`TransportError::AlreadyConnected`] when called while
    /// connecting or connected.
    async fn connect(&mut self, credential: &EphemeralCredential) -> TransportResult<()>;

    /// Append a user text message and request a response
    async fn send_text(&mut self, text: &str) -> TransportResult<()>;

    /// Release the microphone and tear the link down; idempotent
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// Builds a fresh microphone source for each connection attempt
pub type MicrophoneFactory = Arc<dyn Fn() -> Box<dyn MicrophoneSource> + Send + Sync>;

/// Collaborators handed to a transport at construction
#[derive(Clone)]
pub struct TransportContext {
    pub listener: Arc<dyn TransportListener>,
    pub state: Arc<ConnectionStateMachine>,
    pub microphone: MicrophoneFactory,
    pub sink: Arc<dyn AudioSink>,
    /// Sent to the relay as `user_id`
    pub caller_id: String,
    pub frame_ms: u32,
    pub connect_timeout: Duration,
}

impl TransportContext {
    /// Headless defaults: silent microphone, paced sink, own state machine
    pub fn new(listener: Arc<dyn TransportListener>) -> Self {
        Self {
            listener,
            state: Arc::new(ConnectionStateMachine::new()),
            microphone: Arc::new(|| {
                Box::new(ScriptedMicrophone::silent(REALTIME_SAMPLE_RATE)) as Box<dyn MicrophoneSource>
            }),
            sink: Arc::new(PacedSink::default()),
            caller_id: ANONYMOUS_CALLER.to_string(),
            frame_ms: 40,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_state(mut self, state: Arc<ConnectionStateMachine>) -> Self {
        self.state = state;
        self
    }

    pub fn with_microphone<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn MicrophoneSource> + Send + Sync + 'static,
    {
        self.microphone = Arc::new(factory);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = caller_id.into();
        self
    }

    pub fn with_frame_ms(mut self, frame_ms: u32) -> Self {
        self.frame_ms = frame_ms;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enter `connecting` unless the caller already did
    ///
    /// `connecting` is accepted as-is because the reconnection manager
    /// moves the machine there before invoking the connect function.
    /// Returns true when this call started the attempt.
    pub(crate) fn begin_connect(&self) -> TransportResult<bool> {
        match self.state.state() {
            ConnectionState::Connecting => Ok(false),
            ConnectionState::Disconnected | ConnectionState::Error | ConnectionState::Reconnecting => {
                if self.state.transition(ConnectionState::Connecting) {
                    Ok(true)
                } else {
                    Err(TransportError::AlreadyConnected)
                }
            }
            _ => Err(TransportError::AlreadyConnected),
        }
    }

    /// Wait until the event loop has driven the machine to `ready`
    pub(crate) async fn wait_until_ready(&self) -> TransportResult<()> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    ConnectionState::Ready => return Ok(()),
                    state @ (ConnectionState::Error | ConnectionState::Disconnected) => {
                        return Err(TransportError::ConnectionLost(format!(
                            "session entered {state} before becoming ready"
                        )));
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionLost(
                        "state machine dropped".to_string(),
                    ));
                }
            }
        };

        tokio::time::timeout(self.connect_timeout, wait)
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout.as_millis() as u64))?
    }

    /// Record a failed attempt: machine to `error`, error to the listener
    ///
    /// An attempt this transport started itself also reports the link as
    /// down. Attempts driven by the reconnection manager leave that to the
    /// manager's owner.
    pub(crate) fn fail_connect(&self, error: TransportError, started_here: bool) -> TransportError {
        if self.state.state() != ConnectionState::Error {
            self.state.transition(ConnectionState::Error);
        }
        tracing::warn!(error = %error, "Transport connect failed");
        self.listener.on_error(&error);
        if started_here {
            self.listener.on_connection_change(false);
        }
        error
    }
}
