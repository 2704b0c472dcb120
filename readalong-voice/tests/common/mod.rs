//! Shared fixtures for integration tests
//!
//! - `FakeProvider`: an axum server speaking the realtime event protocol on
//!   `/v1/realtime` and answering SDP offers on `/v1/realtime/calls`
//! - `FakePeerFactory`: an in-process peer connection
//! - `RecordingListener` / `RecordingSink`: capture what a transport reports

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use readalong_voice_lib::audio::pcm;
use readalong_voice_lib::audio::{AudioChunk, AudioDirection, AudioResult, AudioSink};
use readalong_voice_lib::credentials::{
    CredentialIssuer, CredentialRequest, EphemeralCredential, EphemeralCredentialService,
    OpaqueTokenMinter,
};
use readalong_voice_lib::state::AppConfig;
use readalong_voice_lib::transport::{
    PeerConnection, PeerConnectionFactory, PeerEvent, TransportError, TransportListener,
    TransportResult,
};

pub const FAKE_SDP_ANSWER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\n";

/// One base64 audio delta of `samples` PCM16 samples
pub fn audio_delta(response_id: &str, item_id: &str, samples: usize) -> Value {
    json!({
        "type": "response.audio.delta",
        "response_id": response_id,
        "item_id": item_id,
        "delta": pcm::encode_samples(&vec![1000i16; samples]),
    })
}

/// Frames the fake provider sends for every `response.create`
pub fn default_reply() -> Vec<Value> {
    vec![
        json!({"type": "response.created", "response": {"id": "resp_1"}}),
        audio_delta("resp_1", "item_1", 480),
        audio_delta("resp_1", "item_1", 480),
        audio_delta("resp_1", "item_1", 480),
        json!({"type": "response.audio_transcript.delta", "item_id": "item_1", "delta": "Great reading!"}),
        json!({"type": "response.audio.done", "response_id": "resp_1", "item_id": "item_1"}),
        json!({"type": "response.audio_transcript.done", "item_id": "item_1", "transcript": "Great reading!"}),
        json!({"type": "response.done", "response": {"id": "resp_1", "status": "completed"}}),
    ]
}

pub fn event_type(frame: &str) -> String {
    serde_json::from_str::<Value>(frame)
        .ok()
        .and_then(|v| v["type"].as_str().map(String::from))
        .unwrap_or_default()
}

struct ProviderState {
    received: Mutex<Vec<String>>,
    authorizations: Mutex<Vec<String>>,
    reply: Mutex<Vec<Value>>,
    reject_auth: AtomicBool,
    sdp_status: Mutex<StatusCode>,
    sdp_offers: Mutex<Vec<(String, String)>>,
    connections: AtomicUsize,
    kick: broadcast::Sender<()>,
}

/// In-process stand-in for the realtime provider
pub struct FakeProvider {
    pub addr: SocketAddr,
    state: Arc<ProviderState>,
    server: tokio::task::JoinHandle<()>,
}

impl FakeProvider {
    pub async fn start() -> Self {
        let (kick, _) = broadcast::channel(4);
        let state = Arc::new(ProviderState {
            received: Mutex::new(Vec::new()),
            authorizations: Mutex::new(Vec::new()),
            reply: Mutex::new(default_reply()),
            reject_auth: AtomicBool::new(false),
            sdp_status: Mutex::new(StatusCode::CREATED),
            sdp_offers: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            kick,
        });

        let app = Router::new()
            .route("/v1/realtime", get(realtime_upgrade))
            .route("/v1/realtime/calls", post(sdp_answer))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            server,
        }
    }

    pub fn realtime_url(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    pub fn calls_url(&self) -> String {
        format!("http://{}/v1/realtime/calls", self.addr)
    }

    /// Config pointing the relay and the transports at this provider
    pub fn config(&self) -> AppConfig {
        let mut config = AppConfig::default();
        config.provider.api_key = "sk-test".to_string();
        config.provider.realtime_url = self.realtime_url();
        config.provider.calls_url = self.calls_url();
        config.relay.bind = "127.0.0.1".to_string();
        config.relay.port = 0;
        config.transport.connect_timeout_ms = 5_000;
        config.reconnect.schedule_ms = vec![50, 100];
        config.reconnect.max_attempts = 3;
        config
    }

    pub fn set_reply(&self, frames: Vec<Value>) {
        *self.state.reply.lock().unwrap() = frames;
    }

    pub fn reject_auth(&self, reject: bool) {
        self.state.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn set_sdp_status(&self, status: StatusCode) {
        *self.state.sdp_status.lock().unwrap() = status;
    }

    /// Close every open provider socket
    pub fn drop_connections(&self) {
        let _ = self.state.kick.send(());
    }

    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn received_types(&self) -> Vec<String> {
        self.received().iter().map(|f| event_type(f)).collect()
    }

    pub fn authorizations(&self) -> Vec<String> {
        self.state.authorizations.lock().unwrap().clone()
    }

    /// `(authorization, body)` of every SDP offer
    pub fn sdp_offers(&self) -> Vec<(String, String)> {
        self.state.sdp_offers.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakeProvider {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn authorization(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn realtime_upgrade(
    State(state): State<Arc<ProviderState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    state.authorizations.lock().unwrap().push(authorization(&headers));
    if state.reject_auth.load(Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| provider_session(socket, state))
}

async fn send_json(socket: &mut WebSocket, value: &Value) -> bool {
    socket.send(Message::Text(value.to_string())).await.is_ok()
}

async fn provider_session(mut socket: WebSocket, state: Arc<ProviderState>) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut kick = state.kick.subscribe();

    let created = json!({"type": "session.created", "session": {"id": "sess_fake", "model": "fake"}});
    if !send_json(&mut socket, &created).await {
        return;
    }

    loop {
        tokio::select! {
            _ = kick.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.received.lock().unwrap().push(text.clone());
                    match event_type(&text).as_str() {
                        "session.update" => {
                            let updated = json!({"type": "session.updated", "session": {"id": "sess_fake"}});
                            if !send_json(&mut socket, &updated).await {
                                break;
                            }
                        }
                        "response.create" => {
                            let reply = state.reply.lock().unwrap().clone();
                            for frame in reply {
                                if !send_json(&mut socket, &frame).await {
                                    return;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn sdp_answer(
    State(state): State<Arc<ProviderState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    state
        .sdp_offers
        .lock()
        .unwrap()
        .push((authorization(&headers), body));

    let status = *state.sdp_status.lock().unwrap();
    if status.is_success() {
        (status, FAKE_SDP_ANSWER).into_response()
    } else {
        (status, "rejected").into_response()
    }
}

/// Everything a transport reported, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Reported {
    Transcription(String, bool),
    Playback(bool),
    Connection(bool),
    Error(String),
    Latency(u64),
    ResponseComplete,
    Chunk(AudioDirection),
    Underrun,
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Reported>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Reported> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Reported) -> bool) -> usize {
        self.events().iter().filter(|e| matches(e)).count()
    }

    fn push(&self, event: Reported) {
        self.events.lock().unwrap().push(event);
    }
}

impl TransportListener for RecordingListener {
    fn on_transcription(&self, text: &str, is_user: bool) {
        self.push(Reported::Transcription(text.to_string(), is_user));
    }

    fn on_audio_playback(&self, playing: bool) {
        self.push(Reported::Playback(playing));
    }

    fn on_connection_change(&self, connected: bool) {
        self.push(Reported::Connection(connected));
    }

    fn on_error(&self, error: &TransportError) {
        self.push(Reported::Error(error.to_string()));
    }

    fn on_latency_update(&self, latency_ms: u64) {
        self.push(Reported::Latency(latency_ms));
    }

    fn on_response_complete(&self) {
        self.push(Reported::ResponseComplete);
    }

    fn on_audio_chunk(&self, direction: AudioDirection) {
        self.push(Reported::Chunk(direction));
    }

    fn on_buffer_underrun(&self) {
        self.push(Reported::Underrun);
    }
}

/// Sink that records the order chunks were played in
pub struct RecordingSink {
    delay: Duration,
    played: Mutex<Vec<u64>>,
    active: AtomicUsize,
    overlapped: AtomicBool,
}

impl RecordingSink {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            played: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
        })
    }

    pub fn played(&self) -> Vec<u64> {
        self.played.lock().unwrap().clone()
    }

    /// Whether two chunks were ever playing at once
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, chunk: &AudioChunk) -> AudioResult<()> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(self.delay).await;
        self.played.lock().unwrap().push(chunk.sequence);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-process peer connection
///
/// Opens its data channel once the answer is applied, then behaves like the
/// provider: `session.created` on open, `session.updated` for every
/// `session.update`, and the scripted reply for `response.create`.
pub struct FakePeer {
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    sent: Mutex<Vec<String>>,
    answer: Mutex<Option<String>>,
    closed: AtomicBool,
    reply: Vec<Value>,
}

impl FakePeer {
    pub fn new(reply: Vec<Value>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(64);
        Arc::new(Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            sent: Mutex::new(Vec::new()),
            answer: Mutex::new(None),
            closed: AtomicBool::new(false),
            reply,
        })
    }

    pub fn sent_types(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|f| event_type(f)).collect()
    }

    pub fn answer(&self) -> Option<String> {
        self.answer.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulate the media engine losing the connection
    pub async fn fail(&self, reason: &str) {
        let _ = self
            .events_tx
            .send(PeerEvent::Closed {
                reason: Some(reason.to_string()),
            })
            .await;
    }

    pub async fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event).await;
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> TransportResult<String> {
        Ok("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=offer\r\n".to_string())
    }

    async fn apply_answer(&self, answer_sdp: &str) -> TransportResult<()> {
        *self.answer.lock().unwrap() = Some(answer_sdp.to_string());
        let _ = self.events_tx.send(PeerEvent::ChannelOpen).await;
        let created = json!({"type": "session.created", "session": {"id": "sess_peer"}});
        let _ = self.events_tx.send(PeerEvent::Message(created.to_string())).await;
        Ok(())
    }

    async fn send(&self, payload: String) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::NotConnected);
        }
        let kind = event_type(&payload);
        self.sent.lock().unwrap().push(payload);

        match kind.as_str() {
            "session.update" => {
                let updated = json!({"type": "session.updated", "session": {"id": "sess_peer"}});
                let _ = self.events_tx.send(PeerEvent::Message(updated.to_string())).await;
            }
            "response.create" => {
                let _ = self.events_tx.send(PeerEvent::RemoteAudio { playing: true }).await;
                for frame in &self.reply {
                    let _ = self.events_tx.send(PeerEvent::Message(frame.to_string())).await;
                }
                let _ = self.events_tx.send(PeerEvent::RemoteAudio { playing: false }).await;
            }
            _ => {}
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out fresh [`FakePeer`]s and remembers them
pub struct FakePeerFactory {
    reply: Vec<Value>,
    created: Mutex<Vec<Arc<FakePeer>>>,
    deny_microphone: AtomicBool,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reply: default_reply(),
            created: Mutex::new(Vec::new()),
            deny_microphone: AtomicBool::new(false),
        })
    }

    pub fn deny_microphone(&self) {
        self.deny_microphone.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<FakePeer>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.created().last().cloned().unwrap()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self) -> TransportResult<Arc<dyn PeerConnection>> {
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Err(readalong_voice_lib::audio::AudioError::PermissionDenied(
                "microphone blocked".to_string(),
            )
            .into());
        }
        let peer = FakePeer::new(self.reply.clone());
        self.created.lock().unwrap().push(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Issuer minting opaque local tokens with `config`'s rate limit
pub fn local_issuer(config: &AppConfig) -> Arc<EphemeralCredentialService> {
    Arc::new(EphemeralCredentialService::new(
        Arc::new(OpaqueTokenMinter::new(config.provider.model.clone())),
        &config.credentials,
    ))
}

/// A fresh credential for `language`
pub async fn issue_credential(language: &str) -> EphemeralCredential {
    local_issuer(&AppConfig::default())
        .issue(CredentialRequest::new(language))
        .await
        .unwrap()
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
