//! Per-session counters and latency statistics

use std::sync::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audio::chunk::AudioDirection;
use crate::transport::{TransportError, TransportKind};
use crate::utils::error::ErrorKind;

/// Nearest-rank percentile of an ascending slice; 0 when empty
pub fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Latency summary derived once at session end
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub mean_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl LatencyStats {
    pub fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let sum: u64 = sorted.iter().sum();

        Self {
            count: sorted.len(),
            mean_ms: sum as f64 / sorted.len() as f64,
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
        }
    }
}

/// Classified error tied to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub session_id: String,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn from_transport(session_id: &str, error: &TransportError) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            timestamp: Utc::now(),
        }
    }
}

/// Metrics persisted at the end of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRecord {
    pub session_id: String,
    pub transport: TransportKind,
    pub connection_started_at: Option<DateTime<Utc>>,
    pub connection_established_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub buffer_underruns: u64,
    pub reconnect_attempts: u64,
    pub responses_completed: u64,
    pub error_count: usize,
    pub latency_samples: Vec<u64>,
    pub latency: LatencyStats,
}

impl MetricsRecord {
    /// Snapshot `collector` and derive latency statistics
    pub fn finalize(collector: &MetricsCollector) -> Self {
        let latency_samples = collector.latency_samples();

        Self {
            session_id: collector.session_id.clone(),
            transport: collector.transport,
            connection_started_at: collector.connection_started_at(),
            connection_established_at: collector.connection_established_at(),
            ended_at: Utc::now(),
            chunks_sent: collector.chunks_sent.load(Ordering::Relaxed),
            chunks_received: collector.chunks_received.load(Ordering::Relaxed),
            buffer_underruns: collector.buffer_underruns.load(Ordering::Relaxed),
            reconnect_attempts: collector.reconnect_attempts.load(Ordering::Relaxed),
            responses_completed: collector.responses_completed.load(Ordering::Relaxed),
            error_count: collector.error_count(),
            latency: LatencyStats::from_samples(&latency_samples),
            latency_samples,
        }
    }
}

/// Counters updated from transport callbacks
#[derive(Debug)]
pub struct MetricsCollector {
    session_id: String,
    transport: TransportKind,
    connection_started_at: Mutex<Option<DateTime<Utc>>>,
    connection_established_at: Mutex<Option<DateTime<Utc>>>,
    chunks_sent: AtomicU64,
    chunks_received: AtomicU64,
    buffer_underruns: AtomicU64,
    reconnect_attempts: AtomicU64,
    responses_completed: AtomicU64,
    latencies: Mutex<Vec<u64>>,
    errors: Mutex<Vec<ErrorRecord>>,
}

impl MetricsCollector {
    pub fn new(session_id: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            session_id: session_id.into(),
            transport,
            connection_started_at: Mutex::new(None),
            connection_established_at: Mutex::new(None),
            chunks_sent: AtomicU64::new(0),
            chunks_received: AtomicU64::new(0),
            buffer_underruns: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            responses_completed: AtomicU64::new(0),
            latencies: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// First connect attempt; later calls keep the original time
    pub fn mark_connection_started(&self) {
        lock(&self.connection_started_at).get_or_insert_with(Utc::now);
    }

    /// First time the session became ready
    pub fn mark_established(&self) {
        lock(&self.connection_established_at).get_or_insert_with(Utc::now);
    }

    pub fn connection_started_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.connection_started_at)
    }

    pub fn connection_established_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.connection_established_at)
    }

    pub fn record_chunk(&self, direction: AudioDirection) {
        let counter = match direction {
            AudioDirection::Outbound => &self.chunks_sent,
            AudioDirection::Inbound => &self.chunks_received,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_underrun(&self) {
        self.buffer_underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self) {
        self.responses_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency_ms: u64) {
        lock(&self.latencies).push(latency_ms);
    }

    pub fn record_error(&self, error: &TransportError) {
        lock(&self.errors).push(ErrorRecord::from_transport(&self.session_id, error));
    }

    pub fn latency_samples(&self) -> Vec<u64> {
        lock(&self.latencies).clone()
    }

    pub fn error_count(&self) -> usize {
        lock(&self.errors).len()
    }

    /// Error records in the order they were raised
    pub fn errors(&self) -> Vec<ErrorRecord> {
        lock(&self.errors).clone()
    }
}

/// A poisoned lock still holds usable samples
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
