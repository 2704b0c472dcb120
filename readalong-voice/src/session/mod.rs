//! Voice session orchestration
//!
//! [`VoiceSession`] ties a credential issuer, one transport and a session
//! monitor together and is the only place that reconnects.
//!
//! # Lifecycle
//!
//! ```text
//! start()
//!   └── issue credential
//!   └── connecting ─► transport_open ─► session_created ─► ready
//!
//! link drops while ready
//!   └── ready ─► reconnecting
//!   └── ReconnectionManager: fresh credential + connect per attempt
//!         ├── success ─► ready
//!         └── exhausted / non-retryable ─► error
//!
//! stop()
//!   └── cancel reconnection, disconnect, persist metrics
//! ```
//!
//! # Example
//!
//! ```ignore
//! use readalong_voice_lib::session::{SessionRequest, VoiceSession};
//!
//! let mut session = VoiceSession::builder(config, issuer)
//!     .with_context(ctx)
//!     .start(SessionRequest::new(Language::Spanish))
//!     .await?;
//!
//! session.send_text("¿Qué pasó en el cuento?").await?;
//! session.stop().await;
//! ```

mod error;
mod transcript;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use error::{SessionError, SessionResult};
pub use transcript::{Speaker, TranscriptEntry, TranscriptLog};

use crate::audio::chunk::AudioDirection;
use crate::credentials::{ANONYMOUS_CALLER, CredentialIssuer, CredentialRequest, EphemeralCredential};
use crate::monitoring::{JsonLinesStore, LogStore, MetricsStore, MonitoredTransport, SessionMonitor};
use crate::profile::{Language, Persona, SessionMetadata};
use crate::reconnect::{ReconnectOutcome, ReconnectionManager};
use crate::state::{AppConfig, ConnectionState, ConnectionStateMachine};
use crate::transport::{
    PeerConnectionFactory, TransportClient, TransportContext, TransportError, TransportKind,
    TransportListener, build_transport,
};

/// How long `stop()` waits for an in-flight reconnection to unwind
const SUPERVISOR_STOP_GRACE: Duration = Duration::from_secs(2);

/// What the caller asks for when starting a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub language: Language,
    pub metadata: SessionMetadata,
    pub caller_id: Option<String>,
}

impl SessionRequest {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            metadata: SessionMetadata::default(),
            caller_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: SessionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    fn caller(&self) -> &str {
        self.caller_id.as_deref().unwrap_or(ANONYMOUS_CALLER)
    }

    fn credential_request(&self) -> CredentialRequest {
        CredentialRequest::new(self.language.code())
            .with_caller(self.caller())
            .with_metadata(self.metadata.clone())
    }
}

/// Identity and lifecycle of one voice session
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub language: Language,
    pub persona: Persona,
    pub activity: Option<String>,
    pub caller_id: String,
    pub created_at: DateTime<Utc>,
    state: Arc<ConnectionStateMachine>,
}

impl Session {
    fn new(
        credential: &EphemeralCredential,
        request: &SessionRequest,
        state: Arc<ConnectionStateMachine>,
    ) -> Self {
        Self {
            id: credential.session_id.clone(),
            language: credential.language,
            persona: credential.persona,
            activity: request.metadata.activity.clone(),
            caller_id: request.caller().to_string(),
            created_at: Utc::now(),
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn state_machine(&self) -> &Arc<ConnectionStateMachine> {
        &self.state
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("persona", &self.persona)
            .field("activity", &self.activity)
            .field("caller_id", &self.caller_id)
            .field("created_at", &self.created_at)
            .field("state", &self.state.state())
            .finish()
    }
}

/// Records the transcript and reports dropped links to the supervisor
struct SessionListener {
    inner: Arc<dyn TransportListener>,
    transcript: Arc<TranscriptLog>,
    drops: mpsc::UnboundedSender<()>,
}

impl TransportListener for SessionListener {
    fn on_transcription(&self, text: &str, is_user: bool) {
        if is_user {
            self.transcript.record_user(text);
        }
        self.inner.on_transcription(text, is_user);
    }

    fn on_agent_transcript(&self, item_id: &str, text: &str, is_final: bool) {
        if is_final {
            self.transcript.agent_done(item_id, text);
        } else {
            self.transcript.agent_delta(item_id, text);
        }
        self.inner.on_agent_transcript(item_id, text, is_final);
    }

    fn on_audio_playback(&self, playing: bool) {
        self.inner.on_audio_playback(playing);
    }

    fn on_audio_level(&self, dbfs: f32) {
        self.inner.on_audio_level(dbfs);
    }

    fn on_connection_change(&self, connected: bool) {
        if !connected {
            let _ = self.drops.send(());
        }
        self.inner.on_connection_change(connected);
    }

    fn on_error(&self, error: &TransportError) {
        self.inner.on_error(error);
    }

    fn on_latency_update(&self, latency_ms: u64) {
        self.inner.on_latency_update(latency_ms);
    }

    fn on_response_complete(&self) {
        self.transcript.commit_agent();
        self.inner.on_response_complete();
    }

    fn on_audio_chunk(&self, direction: AudioDirection) {
        self.inner.on_audio_chunk(direction);
    }

    fn on_buffer_underrun(&self) {
        self.inner.on_buffer_underrun();
    }
}

/// Configures and starts a [`VoiceSession`]
pub struct VoiceSessionBuilder {
    config: Arc<AppConfig>,
    issuer: Arc<dyn CredentialIssuer>,
    store: Option<Arc<dyn MetricsStore>>,
    context: Option<TransportContext>,
    peer_factory: Option<Arc<dyn PeerConnectionFactory>>,
    transport: TransportKind,
}

impl VoiceSessionBuilder {
    /// Metrics destination; defaults to the configured JSON lines files, or
    /// the log when none are configured
    pub fn with_store(mut self, store: Arc<dyn MetricsStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Listener, microphone, sink and state machine for the transport
    pub fn with_context(mut self, context: TransportContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    /// Overrides `transport.kind` from the config
    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport = kind;
        self
    }

    /// Issue a credential and connect
    ///
    /// # Errors
    ///
    /// - `SessionError::AlreadyRunning` - the state machine is not idle
    /// - `SessionError::Credential` - issuance failed; nothing was opened
    /// - `SessionError::Transport` - the first connect failed; metrics for
    ///   the failed attempt are persisted before returning
    pub async fn start(self, request: SessionRequest) -> SessionResult<VoiceSession> {
        let context = match self.context {
            Some(context) => context,
            None => TransportContext::new(Arc::new(crate::transport::NoopListener)),
        };
        let state = Arc::clone(&context.state);
        if !state.state().is_idle() {
            return Err(SessionError::AlreadyRunning);
        }

        info!(
            language = request.language.code(),
            caller_id = request.caller(),
            transport = %self.transport,
            "Starting voice session"
        );

        let credential = self.issuer.issue(request.credential_request()).await?;
        let session = Session::new(&credential, &request, Arc::clone(&state));

        let store = self.store.unwrap_or_else(|| default_store(&self.config));
        let monitor = Arc::new(SessionMonitor::new(session.id.clone(), self.transport, store));
        let transcript = Arc::new(TranscriptLog::new());
        let (drop_tx, drop_rx) = mpsc::unbounded_channel();
        let caller_listener = Arc::clone(&context.listener);

        let listener = monitor.listener(Arc::new(SessionListener {
            inner: Arc::clone(&context.listener),
            transcript: Arc::clone(&transcript),
            drops: drop_tx,
        }));
        let ctx = TransportContext {
            listener,
            ..context
        }
        .with_caller(request.caller());

        let transport = build_transport(self.transport, &self.config, ctx, self.peer_factory)?;
        let mut transport = monitor.wrap(transport);

        if let Err(e) = transport.connect(&credential).await {
            error!(session_id = %session.id, error = %e, "Voice session failed to connect");
            transport.disconnect().await;
            return Err(e.into());
        }
        info!(session_id = %session.id, "Voice session ready");

        let transport = Arc::new(Mutex::new(transport));
        let reconnect = Arc::new(ReconnectionManager::new(self.config.reconnect.policy()));
        let stopping = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = watch::channel(false);

        let supervisor = tokio::spawn(supervise(
            drop_rx,
            stop_rx,
            Reconnector {
                session_id: session.id.clone(),
                request,
                issuer: self.issuer,
                transport: Arc::clone(&transport),
                reconnect: Arc::clone(&reconnect),
                monitor: Arc::clone(&monitor),
                listener: caller_listener,
                state,
                stopping: Arc::clone(&stopping),
            },
        ));

        Ok(VoiceSession {
            session,
            transport,
            monitor,
            transcript,
            reconnect,
            stopping,
            stop_tx,
            supervisor: Some(supervisor),
        })
    }
}

fn default_store(config: &AppConfig) -> Arc<dyn MetricsStore> {
    match JsonLinesStore::from_config(&config.monitoring) {
        Some(store) => Arc::new(store),
        None => Arc::new(LogStore),
    }
}

/// A running voice session
///
/// Owns the transport exclusively. A dropped link is re-established by a
/// supervisor task on the configured fixed schedule; nothing else retries.
pub struct VoiceSession {
    session: Session,
    transport: Arc<Mutex<MonitoredTransport>>,
    monitor: Arc<SessionMonitor>,
    transcript: Arc<TranscriptLog>,
    reconnect: Arc<ReconnectionManager>,
    stopping: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
}

impl fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceSession")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl VoiceSession {
    pub fn builder(config: AppConfig, issuer: Arc<dyn CredentialIssuer>) -> VoiceSessionBuilder {
        let transport = config.transport.kind;
        VoiceSessionBuilder {
            config: Arc::new(config),
            issuer,
            store: None,
            context: None,
            peer_factory: None,
            transport,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn monitor(&self) -> &Arc<SessionMonitor> {
        &self.monitor
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.entries()
    }

    pub fn is_running(&self) -> bool {
        !self.stopping.load(Ordering::SeqCst)
    }

    /// Whether a reconnection run is in progress
    pub fn is_reconnecting(&self) -> bool {
        self.reconnect.is_running()
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_connected()
    }

    /// Send a typed message and request a reply
    pub async fn send_text(&self, text: &str) -> SessionResult<()> {
        if !self.is_running() {
            return Err(SessionError::NotRunning);
        }
        self.transport.lock().await.send_text(text).await?;
        Ok(())
    }

    /// Cancel reconnection, disconnect and persist monitoring; idempotent
    pub async fn stop(&mut self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.session.id, "Session already stopped");
            return;
        }
        info!(session_id = %self.session.id, "Stopping voice session");

        self.reconnect.cancel();
        let _ = self.stop_tx.send(true);
        if let Some(mut supervisor) = self.supervisor.take() {
            if tokio::time::timeout(SUPERVISOR_STOP_GRACE, &mut supervisor)
                .await
                .is_err()
            {
                warn!(session_id = %self.session.id, "Supervisor did not stop in time");
                supervisor.abort();
            }
        }

        self.transport.lock().await.disconnect().await;
        self.transcript.commit_agent();
        info!(
            session_id = %self.session.id,
            transcript_entries = self.transcript.len(),
            "Voice session stopped"
        );
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.reconnect.cancel();
        let _ = self.stop_tx.send(true);
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

/// Everything the supervisor needs to re-establish the link
struct Reconnector {
    session_id: String,
    request: SessionRequest,
    issuer: Arc<dyn CredentialIssuer>,
    transport: Arc<Mutex<MonitoredTransport>>,
    reconnect: Arc<ReconnectionManager>,
    monitor: Arc<SessionMonitor>,
    /// The caller's listener, told when recovery gives up
    listener: Arc<dyn TransportListener>,
    state: Arc<ConnectionStateMachine>,
    stopping: Arc<AtomicBool>,
}

impl Reconnector {
    async fn recover(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        // Only a ready session that lost its link is recovered here
        if !self.state.transition(ConnectionState::Reconnecting) {
            debug!(
                session_id = %self.session_id,
                state = %self.state.state(),
                "Ignoring link drop outside ready"
            );
            return;
        }
        warn!(session_id = %self.session_id, "Link dropped, reconnecting");

        let outcome = self
            .reconnect
            .attempt_reconnection(&self.state, |attempt| {
                let issuer = Arc::clone(&self.issuer);
                let transport = Arc::clone(&self.transport);
                let monitor = Arc::clone(&self.monitor);
                let stopping = Arc::clone(&self.stopping);
                let request = self.request.credential_request();
                let session_id = self.session_id.clone();

                async move {
                    if stopping.load(Ordering::SeqCst) {
                        return Err(TransportError::NotConnected);
                    }
                    monitor.record_reconnect_attempt();
                    debug!(session_id = %session_id, attempt, "Requesting fresh credential");

                    let credential = issuer.issue(request).await?;
                    transport.lock().await.connect(&credential).await
                }
            })
            .await;

        match outcome {
            ReconnectOutcome::Connected { attempts } => {
                info!(session_id = %self.session_id, attempts, "Session recovered");
            }
            ReconnectOutcome::Exhausted { attempts } => {
                error!(session_id = %self.session_id, attempts, "Reconnection gave up");
                self.listener.on_connection_change(false);
            }
            ReconnectOutcome::Aborted { attempts, reason } => {
                error!(session_id = %self.session_id, attempts, reason = %reason, "Reconnection aborted");
                self.listener.on_connection_change(false);
            }
            ReconnectOutcome::Cancelled => {
                debug!(session_id = %self.session_id, "Reconnection cancelled");
            }
            ReconnectOutcome::AlreadyRunning => {}
        }
    }
}

async fn supervise(
    mut drops: mpsc::UnboundedReceiver<()>,
    mut stop: watch::Receiver<bool>,
    reconnector: Reconnector,
) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            signal = drops.recv() => {
                if signal.is_none() {
                    break;
                }
                reconnector.recover().await;
                // Drops reported while recovering belong to links already replaced
                while drops.try_recv().is_ok() {}
            }
        }
    }
    debug!(session_id = %reconnector.session_id, "Session supervisor finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_to_anonymous_caller() {
        let request = SessionRequest::new(Language::English);
        assert_eq!(request.caller(), ANONYMOUS_CALLER);

        let credential_request = request.credential_request();
        assert_eq!(credential_request.language, "en");
        assert_eq!(credential_request.caller_id.as_deref(), Some(ANONYMOUS_CALLER));
    }

    #[test]
    fn test_request_carries_metadata() {
        let metadata = SessionMetadata {
            persona: Some(Persona::Coach),
            grade: Some(1),
            activity: Some("Sight words".to_string()),
        };
        let request = SessionRequest::new(Language::Spanish)
            .with_caller("kid-7")
            .with_metadata(metadata.clone());

        let credential_request = request.credential_request();
        assert_eq!(credential_request.caller_id.as_deref(), Some("kid-7"));
        assert_eq!(credential_request.session_metadata, Some(metadata));
    }

    #[test]
    fn test_listener_signals_drop_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = SessionListener {
            inner: Arc::new(crate::transport::NoopListener),
            transcript: Arc::new(TranscriptLog::new()),
            drops: tx,
        };

        listener.on_connection_change(true);
        assert!(rx.try_recv().is_err());
        listener.on_connection_change(false);
        assert!(rx.try_recv().is_ok());
    }
}
