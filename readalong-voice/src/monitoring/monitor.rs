use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::audio::chunk::AudioDirection;
use crate::credentials::EphemeralCredential;
use crate::monitoring::metrics::{MetricsCollector, MetricsRecord};
use crate::monitoring::store::MetricsStore;
use crate::transport::{TransportClient, TransportError, TransportKind, TransportListener, TransportResult};

/// Metrics for one session
///
/// Install [`listener`](Self::listener) in the transport's context, then
/// [`wrap`](Self::wrap) the built transport. Records are persisted by
/// [`finish`](Self::finish), which the wrapped transport calls on
/// `disconnect()`.
pub struct SessionMonitor {
    collector: Arc<MetricsCollector>,
    store: Arc<dyn MetricsStore>,
    finished: AtomicBool,
}

impl SessionMonitor {
    pub fn new(
        session_id: impl Into<String>,
        transport: TransportKind,
        store: Arc<dyn MetricsStore>,
    ) -> Self {
        Self {
            collector: Arc::new(MetricsCollector::new(session_id, transport)),
            store,
            finished: AtomicBool::new(false),
        }
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    /// Listener that counts events and forwards them to `inner`
    pub fn listener(&self, inner: Arc<dyn TransportListener>) -> Arc<dyn TransportListener> {
        Arc::new(CountingListener {
            collector: Arc::clone(&self.collector),
            inner,
        })
    }

    pub fn wrap(self: &Arc<Self>, transport: Box<dyn TransportClient>) -> MonitoredTransport {
        MonitoredTransport {
            inner: transport,
            monitor: Arc::clone(self),
        }
    }

    pub fn record_reconnect_attempt(&self) {
        self.collector.record_reconnect_attempt();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Persist metrics, then errors; only the first call does anything
    ///
    /// Store failures are logged and the record is still returned.
    pub async fn finish(&self) -> Option<MetricsRecord> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return None;
        }

        let record = MetricsRecord::finalize(&self.collector);
        let errors = self.collector.errors();

        if let Err(e) = self.store.save_metrics(&record).await {
            warn!(session_id = %record.session_id, "Failed to persist session metrics: {}", e);
        }
        if let Err(e) = self.store.save_errors(&errors).await {
            warn!(session_id = %record.session_id, "Failed to persist session errors: {}", e);
        }

        debug!(
            session_id = %record.session_id,
            latency_samples = record.latency.count,
            errors = errors.len(),
            "Session monitoring finished"
        );
        Some(record)
    }
}

struct CountingListener {
    collector: Arc<MetricsCollector>,
    inner: Arc<dyn TransportListener>,
}

impl TransportListener for CountingListener {
    fn on_transcription(&self, text: &str, is_user: bool) {
        self.inner.on_transcription(text, is_user);
    }

    fn on_agent_transcript(&self, item_id: &str, text: &str, is_final: bool) {
        self.inner.on_agent_transcript(item_id, text, is_final);
    }

    fn on_audio_playback(&self, playing: bool) {
        self.inner.on_audio_playback(playing);
    }

    fn on_audio_level(&self, dbfs: f32) {
        self.inner.on_audio_level(dbfs);
    }

    fn on_connection_change(&self, connected: bool) {
        if connected {
            self.collector.mark_established();
        }
        self.inner.on_connection_change(connected);
    }

    fn on_error(&self, error: &TransportError) {
        self.collector.record_error(error);
        self.inner.on_error(error);
    }

    fn on_latency_update(&self, latency_ms: u64) {
        self.collector.record_latency(latency_ms);
        self.inner.on_latency_update(latency_ms);
    }

    fn on_response_complete(&self) {
        self.collector.record_response();
        self.inner.on_response_complete();
    }

    fn on_audio_chunk(&self, direction: AudioDirection) {
        self.collector.record_chunk(direction);
        self.inner.on_audio_chunk(direction);
    }

    fn on_buffer_underrun(&self) {
        self.collector.record_underrun();
        self.inner.on_buffer_underrun();
    }
}

/// A transport whose lifecycle is recorded by a [`SessionMonitor`]
pub struct MonitoredTransport {
    inner: Box<dyn TransportClient>,
    monitor: Arc<SessionMonitor>,
}

impl MonitoredTransport {
    pub fn monitor(&self) -> &Arc<SessionMonitor> {
        &self.monitor
    }
}

#[async_trait]
impl TransportClient for MonitoredTransport {
    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    async fn connect(&mut self, credential: &EphemeralCredential) -> TransportResult<()> {
        self.monitor.collector.mark_connection_started();
        self.inner.connect(credential).await
    }

    async fn send_text(&mut self, text: &str) -> TransportResult<()> {
        self.inner.send_text(text).await
    }

    async fn disconnect(&mut self) {
        self.inner.disconnect().await;
        self.monitor.finish().await;
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}
