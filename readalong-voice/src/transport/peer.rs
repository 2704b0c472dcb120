//! Peer transport
//!
//! Negotiates a direct media session with the provider: the local SDP offer
//! is POSTed to the provider's calls endpoint, authenticated by the
//! ephemeral credential, and the raw SDP answer is applied as the remote
//! description. Audio flows as media tracks rendered by the media engine;
//! provider events arrive on a data channel and go through the shared
//! [`EventInterpreter`].
//!
//! The media engine itself sits behind [`PeerConnection`] so the transport
//! logic is independent of the WebRTC stack in use.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialError, EphemeralCredential};
use crate::network::protocol::{ClientEvent, InboundFrame, SessionSettings};
use crate::profile::TurnDetection;
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::transport::client::{TransportClient, TransportContext, TransportKind, TransportListener};
use crate::transport::error::{TransportError, TransportResult};
use crate::transport::interpreter::{Action, EventInterpreter};

/// Events surfaced by the media engine
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// The provider event data channel opened
    ChannelOpen,
    /// Provider event received on the data channel
    Message(String),
    /// Remote audio track started or stopped rendering
    RemoteAudio { playing: bool },
    /// Level of the local microphone track
    LocalLevel(f32),
    /// Connection closed or failed
    Closed { reason: Option<String> },
}

/// A peer connection with one microphone track and one data channel
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create the local offer and set it as the local description
    async fn create_offer(&self) -> TransportResult<String>;

    /// Apply the provider's answer as the remote description
    async fn apply_answer(&self, answer_sdp: &str) -> TransportResult<()>;

    /// Send a provider event on the data channel
    async fn send(&self, payload: String) -> TransportResult<()>;

    /// Event stream; `None` once taken
    fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>>;

    /// Stop tracks and close the connection
    async fn close(&self);
}

/// Builds peer connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Acquire the microphone track and create a connection around it
    ///
    /// Permission refusal is reported as an audio resource error.
    async fn create(&self) -> TransportResult<Arc<dyn PeerConnection>>;
}

/// SDP offer/answer exchange with the provider
pub struct SdpExchange {
    client: reqwest::Client,
    calls_url: String,
}

impl SdpExchange {
    pub fn new(calls_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            calls_url: calls_url.into(),
        }
    }

    /// POST `offer_sdp` and return the raw answer body
    pub async fn exchange(
        &self,
        offer_sdp: &str,
        credential: &EphemeralCredential,
    ) -> TransportResult<String> {
        let response = self
            .client
            .post(&self.calls_url)
            .query(&[("model", credential.model.as_str())])
            .bearer_auth(&credential.credential)
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| TransportError::Negotiation(format!("SDP exchange failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CredentialError::InvalidRequest(
                "Credential rejected by provider".to_string(),
            )
            .into());
        }

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Negotiation(format!("Failed to read SDP answer: {e}")))?;

        if !status.is_success() {
            return Err(TransportError::Negotiation(format!(
                "SDP exchange returned {status}: {body}"
            )));
        }
        if !body.trim_start().starts_with("v=") {
            return Err(TransportError::Negotiation(
                "Response is not an SDP answer".to_string(),
            ));
        }

        debug!(bytes = body.len(), "Received SDP answer");
        Ok(body)
    }
}

/// Transport holding a direct session with the provider
pub struct PeerTransport {
    factory: Arc<dyn PeerConnectionFactory>,
    exchange: SdpExchange,
    ctx: TransportContext,
    link: Option<PeerLink>,
}

struct PeerLink {
    connection: Arc<dyn PeerConnection>,
    interpreter: Arc<EventInterpreter>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    event_loop: JoinHandle<()>,
}

impl PeerLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn shutdown(self) {
        self.closing.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.connection.close().await;
        self.event_loop.abort();
    }
}

impl PeerTransport {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        calls_url: impl Into<String>,
        ctx: TransportContext,
    ) -> Self {
        Self {
            factory,
            exchange: SdpExchange::new(calls_url),
            ctx,
            link: None,
        }
    }

    async fn open_link(&self, credential: &EphemeralCredential) -> TransportResult<PeerLink> {
        if credential.is_expired() {
            return Err(CredentialError::InvalidRequest("Credential has expired".to_string()).into());
        }

        let connection = self.factory.create().await?;
        let events = connection.take_events().ok_or_else(|| {
            TransportError::InvalidConfig("peer connection events already taken".to_string())
        })?;

        let negotiated = async {
            let offer = connection.create_offer().await?;
            let answer = self.exchange.exchange(&offer, credential).await?;
            connection.apply_answer(&answer).await
        };
        if let Err(e) = negotiated.await {
            connection.close().await;
            return Err(e);
        }
        info!(session_id = %credential.session_id, "Peer session negotiated");

        let interpreter = Arc::new(EventInterpreter::new(
            Arc::clone(&self.ctx.listener),
            Arc::clone(&self.ctx.state),
        ));
        let connected = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));

        let event_loop = tokio::spawn(run_event_loop(
            events,
            Arc::clone(&connection),
            Arc::clone(&interpreter),
            Arc::clone(&self.ctx.state),
            Arc::clone(&self.ctx.listener),
            Arc::clone(&connected),
            Arc::clone(&closing),
            credential.turn_detection.clone(),
        ));

        let link = PeerLink {
            connection,
            interpreter,
            connected,
            closing,
            event_loop,
        };

        if let Err(e) = self.ctx.wait_until_ready().await {
            link.shutdown().await;
            return Err(e);
        }
        link.connected.store(true, Ordering::SeqCst);
        Ok(link)
    }
}

#[async_trait]
impl TransportClient for PeerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Peer
    }

    async fn connect(&mut self, credential: &EphemeralCredential) -> TransportResult<()> {
        if self.link.as_ref().is_some_and(PeerLink::is_connected) {
            return Err(TransportError::AlreadyConnected);
        }
        let started_here = self.ctx.begin_connect()?;

        if let Some(stale) = self.link.take() {
            stale.shutdown().await;
        }

        match self.open_link(credential).await {
            Ok(link) => {
                self.link = Some(link);
                info!(session_id = %credential.session_id, "Peer transport ready");
                self.ctx.listener.on_connection_change(true);
                Ok(())
            }
            Err(e) => Err(self.ctx.fail_connect(e, started_here)),
        }
    }

    async fn send_text(&mut self, text: &str) -> TransportResult<()> {
        let link = self
            .link
            .as_ref()
            .filter(|link| link.is_connected())
            .ok_or(TransportError::NotConnected)?;

        link.interpreter.mark_turn_end();
        for event in ClientEvent::text_message(text) {
            let payload = serde_json::to_string(&event)
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            link.connection.send(payload).await?;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            let was_connected = link.is_connected();
            link.shutdown().await;
            if was_connected {
                self.ctx.listener.on_connection_change(false);
            }
            info!("Peer transport disconnected");
        }

        if self.ctx.state.state() != ConnectionState::Disconnected {
            self.ctx.state.transition(ConnectionState::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(PeerLink::is_connected)
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.closing.store(true, Ordering::SeqCst);
            link.event_loop.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_event_loop(
    mut events: mpsc::Receiver<PeerEvent>,
    connection: Arc<dyn PeerConnection>,
    interpreter: Arc<EventInterpreter>,
    state: Arc<ConnectionStateMachine>,
    listener: Arc<dyn TransportListener>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    turn_detection: TurnDetection,
) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::ChannelOpen => {
                if state.state() == ConnectionState::Connecting {
                    state.transition(ConnectionState::TransportOpen);
                }
                let update = ClientEvent::SessionUpdate {
                    session: SessionSettings::turn_detection_only(turn_detection.clone()),
                };
                match serde_json::to_string(&update) {
                    Ok(payload) => {
                        if let Err(e) = connection.send(payload).await {
                            warn!("Failed to send turn detection update: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to encode turn detection update: {}", e),
                }
            }
            PeerEvent::Message(text) => {
                // Inbound audio is rendered by the media engine, so only
                // fatal actions matter here
                if let Action::Fatal(error) = interpreter.handle_frame(InboundFrame::decode(&text)) {
                    warn!(error = %error, "Closing peer link after fatal error");
                    break;
                }
            }
            PeerEvent::RemoteAudio { playing } => listener.on_audio_playback(playing),
            PeerEvent::LocalLevel(dbfs) => listener.on_audio_level(dbfs),
            PeerEvent::Closed { reason } => {
                debug!(?reason, "Peer connection closed");
                break;
            }
        }
    }

    let was_connected = connected.swap(false, Ordering::SeqCst);
    if closing.load(Ordering::SeqCst) {
        return;
    }

    if state.state().is_establishing() {
        state.transition(ConnectionState::Error);
    }
    if was_connected {
        warn!("Peer link dropped");
        listener.on_connection_change(false);
    }
}
