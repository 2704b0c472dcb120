//! Relayed socket transport
//!
//! Streams microphone frames as `input_audio_buffer.append` events over a
//! WebSocket to the relay bridge and plays received audio deltas through a
//! serial playback queue.
//!
//! ```text
//! microphone -> CapturePipeline -> forward_frames -> sender_task -> relay
//! relay -> receiver_task -> event loop -> EventInterpreter -> PlaybackQueue
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::capture::{CapturePipeline, CapturedFrame};
use crate::audio::chunk::{AudioChunk, AudioDirection};
use crate::audio::playback::{PlaybackEvent, PlaybackQueue};
use crate::credentials::{CredentialError, EphemeralCredential};
use crate::network::connection::{ConnectionConfig, RealtimeConnection};
use crate::network::error::NetworkResult;
use crate::network::protocol::{ClientEvent, InboundFrame, SessionSettings};
use crate::network::tasks::{receiver_task, sender_task};
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::transport::client::{TransportClient, TransportContext, TransportKind, TransportListener};
use crate::transport::error::{TransportError, TransportResult};
use crate::transport::interpreter::{Action, EventInterpreter};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const FRAME_CHANNEL_CAPACITY: usize = 256;
const CAPTURE_CHANNEL_CAPACITY: usize = 64;

/// How long `disconnect` waits for the close frame to go out
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Transport that talks to the provider through the relay bridge
pub struct RelayedSocketTransport {
    relay_url: String,
    ctx: TransportContext,
    link: Option<RelayLink>,
}

struct RelayLink {
    event_tx: mpsc::Sender<ClientEvent>,
    capture: Option<CapturePipeline>,
    playback: Arc<PlaybackQueue>,
    interpreter: Arc<EventInterpreter>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    sender: JoinHandle<NetworkResult<()>>,
    receiver: JoinHandle<NetworkResult<()>>,
    event_loop: JoinHandle<()>,
    forwarder: Option<JoinHandle<()>>,
}

impl RelayedSocketTransport {
    /// `relay_url` is the bridge's `/relay` endpoint (ws:// or wss://)
    pub fn new(relay_url: impl Into<String>, ctx: TransportContext) -> Self {
        Self {
            relay_url: relay_url.into(),
            ctx,
            link: None,
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Socket parameters for `credential`
    pub fn connection_config(&self, credential: &EphemeralCredential) -> ConnectionConfig {
        ConnectionConfig::new(self.relay_url.clone())
            .with_query("jwt", credential.credential.clone())
            .with_query("user_id", self.ctx.caller_id.clone())
            .with_query("language", credential.language.code())
            .with_query("model", credential.model.clone())
            .with_query("persona", credential.persona.name())
            .with_timeout(self.ctx.connect_timeout.as_millis() as u64)
    }

    async fn open_link(&self, credential: &EphemeralCredential) -> TransportResult<RelayLink> {
        if credential.is_expired() {
            return Err(CredentialError::InvalidRequest("Credential has expired".to_string()).into());
        }

        let config = self.connection_config(credential);
        let connection = RealtimeConnection::connect(&config).await?;
        self.ctx.state.transition(ConnectionState::TransportOpen);
        info!(session_id = %credential.session_id, "Relay socket open");

        let (writer, reader) = connection.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        let sender = tokio::spawn(sender_task(writer, event_rx));
        let receiver = tokio::spawn(receiver_task(reader, frame_tx));

        let listener = Arc::clone(&self.ctx.listener);
        let interpreter = Arc::new(EventInterpreter::new(
            Arc::clone(&listener),
            Arc::clone(&self.ctx.state),
        ));
        let playback = Arc::new(PlaybackQueue::new(Arc::clone(&self.ctx.sink), {
            let listener = Arc::clone(&listener);
            move |event| match event {
                PlaybackEvent::Started => listener.on_audio_playback(true),
                PlaybackEvent::Finished => listener.on_audio_playback(false),
                PlaybackEvent::Underrun => listener.on_buffer_underrun(),
            }
        }));

        let connected = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));

        let event_loop = tokio::spawn(run_event_loop(
            frame_rx,
            Arc::clone(&interpreter),
            Arc::clone(&playback),
            Arc::clone(&self.ctx.state),
            Arc::clone(&listener),
            Arc::clone(&connected),
            Arc::clone(&closing),
        ));

        let mut link = RelayLink {
            event_tx,
            capture: None,
            playback,
            interpreter,
            connected,
            closing,
            sender,
            receiver,
            event_loop,
            forwarder: None,
        };

        if let Err(e) = self.establish(&mut link, credential).await {
            link.shutdown().await;
            return Err(e);
        }
        Ok(link)
    }

    /// Tune VAD, wait for the session, then start the microphone
    async fn establish(
        &self,
        link: &mut RelayLink,
        credential: &EphemeralCredential,
    ) -> TransportResult<()> {
        let turn_detection = ClientEvent::SessionUpdate {
            session: SessionSettings::turn_detection_only(credential.turn_detection.clone()),
        };
        link.event_tx
            .send(turn_detection)
            .await
            .map_err(|_| TransportError::ConnectionLost("relay socket closed".to_string()))?;

        self.ctx.wait_until_ready().await?;

        let (frame_tx, frame_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let mut capture = CapturePipeline::new((self.ctx.microphone)(), self.ctx.frame_ms);
        capture.start(frame_tx).await?;

        link.forwarder = Some(tokio::spawn(forward_frames(
            frame_rx,
            link.event_tx.clone(),
            Arc::clone(&self.ctx.listener),
            Arc::clone(&self.ctx.state),
        )));
        link.capture = Some(capture);
        link.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl RelayLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn shutdown(mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut capture) = self.capture.take() {
            capture.stop().await;
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.playback.shutdown();

        // Closing the channel makes the sender task send a close frame
        drop(self.event_tx);
        match tokio::time::timeout(CLOSE_GRACE, &mut self.sender).await {
            Ok(Ok(Ok(()))) => debug!("Relay sender closed cleanly"),
            Ok(Ok(Err(e))) => debug!("Relay sender ended with error: {}", e),
            Ok(Err(e)) => warn!("Relay sender task failed: {}", e),
            Err(_) => {
                debug!("Relay sender did not close in time");
                self.sender.abort();
            }
        }
        self.receiver.abort();
        self.event_loop.abort();
    }

    fn abort(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.playback.shutdown();
        self.sender.abort();
        self.receiver.abort();
        self.event_loop.abort();
    }
}

#[async_trait]
impl TransportClient for RelayedSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relayed
    }

    async fn connect(&mut self, credential: &EphemeralCredential) -> TransportResult<()> {
        if self.link.as_ref().is_some_and(RelayLink::is_connected) {
            return Err(TransportError::AlreadyConnected);
        }
        let started_here = self.ctx.begin_connect()?;

        // A link that dropped on its own is cleaned up before reconnecting
        if let Some(stale) = self.link.take() {
            stale.shutdown().await;
        }

        match self.open_link(credential).await {
            Ok(link) => {
                self.link = Some(link);
                info!(session_id = %credential.session_id, "Relayed transport ready");
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
            link.event_tx
                .send(event)
                .await
                .map_err(|_| TransportError::ConnectionLost("relay socket closed".to_string()))?;
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
            info!("Relayed transport disconnected");
        }

        if self.ctx.state.state() != ConnectionState::Disconnected {
            self.ctx.state.transition(ConnectionState::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(RelayLink::is_connected)
    }
}

impl Drop for RelayedSocketTransport {
    fn drop(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.abort();
        }
    }
}

/// Forward captured frames as append events while the session is ready
async fn forward_frames(
    mut frames: mpsc::Receiver<CapturedFrame>,
    event_tx: mpsc::Sender<ClientEvent>,
    listener: Arc<dyn TransportListener>,
    state: Arc<ConnectionStateMachine>,
) {
    let mut sent = 0u64;
    while let Some(frame) = frames.recv().await {
        listener.on_audio_level(frame.level_dbfs);
        if !state.can_send_messages() {
            continue;
        }
        if event_tx
            .send(ClientEvent::audio_append(&frame.samples))
            .await
            .is_err()
        {
            break;
        }
        sent += 1;
        listener.on_audio_chunk(AudioDirection::Outbound);
    }
    debug!(sent, "Frame forwarder finished");
}

async fn run_event_loop(
    mut frames: mpsc::Receiver<InboundFrame>,
    interpreter: Arc<EventInterpreter>,
    playback: Arc<PlaybackQueue>,
    state: Arc<ConnectionStateMachine>,
    listener: Arc<dyn TransportListener>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) {
    let mut sequence = 0u64;

    while let Some(frame) = frames.recv().await {
        match interpreter.handle_frame(frame) {
            Action::None => {}
            Action::PlayAudio { item_id, delta } => match AudioChunk::from_base64(sequence, &delta) {
                Ok(chunk) => {
                    sequence += 1;
                    playback.set_streaming(true);
                    playback.enqueue(chunk);
                }
                Err(e) => warn!(item_id = %item_id, "Dropping undecodable audio delta: {}", e),
            },
            Action::AudioFinished => playback.set_streaming(false),
            Action::BargeIn => {
                if playback.is_playing() || playback.pending() > 0 {
                    debug!("Barge-in, clearing playback");
                    playback.clear();
                }
            }
            Action::Fatal(error) => {
                warn!(error = %error, "Closing relay link after fatal error");
                break;
            }
        }
    }

    playback.set_streaming(false);
    let was_connected = connected.swap(false, Ordering::SeqCst);
    if closing.load(Ordering::SeqCst) {
        return;
    }

    if state.state().is_establishing() {
        state.transition(ConnectionState::Error);
    }
    if was_connected {
        warn!("Relay link dropped");
        listener.on_connection_change(false);
    }
}
