//! Metrics persistence backends

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::monitoring::error::{MonitoringError, MonitoringResult};
use crate::monitoring::metrics::{ErrorRecord, MetricsRecord};
use crate::state::config::MonitoringConfig;

/// Destination for end-of-session records
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn save_metrics(&self, record: &MetricsRecord) -> MonitoringResult<()>;

    async fn save_errors(&self, records: &[ErrorRecord]) -> MonitoringResult<()>;
}

/// Appends one JSON object per line
#[derive(Debug, Clone)]
pub struct JsonLinesStore {
    metrics_path: PathBuf,
    errors_path: PathBuf,
}

impl JsonLinesStore {
    pub fn new(metrics_path: impl Into<PathBuf>, errors_path: impl Into<PathBuf>) -> Self {
        Self {
            metrics_path: metrics_path.into(),
            errors_path: errors_path.into(),
        }
    }

    /// `None` unless `metrics_path` is configured
    ///
    /// Errors default to `<metrics stem>.errors.jsonl` next to the metrics file.
    pub fn from_config(config: &MonitoringConfig) -> Option<Self> {
        let metrics_path = config.metrics_path.clone()?;
        let errors_path = config
            .errors_path
            .clone()
            .unwrap_or_else(|| metrics_path.with_extension("errors.jsonl"));
        Some(Self::new(metrics_path, errors_path))
    }

    pub fn metrics_path(&self) -> &Path {
        &self.metrics_path
    }

    pub fn errors_path(&self) -> &Path {
        &self.errors_path
    }
}

async fn append_lines<T: Serialize>(path: &Path, items: &[T]) -> MonitoringResult<()> {
    if items.is_empty() {
        return Ok(());
    }

    let mut buffer = String::new();
    for item in items {
        buffer.push_str(&serde_json::to_string(item)?);
        buffer.push('\n');
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(buffer.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl MetricsStore for JsonLinesStore {
    async fn save_metrics(&self, record: &MetricsRecord) -> MonitoringResult<()> {
        append_lines(&self.metrics_path, std::slice::from_ref(record)).await
    }

    async fn save_errors(&self, records: &[ErrorRecord]) -> MonitoringResult<()> {
        append_lines(&self.errors_path, records).await
    }
}

/// Writes records to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStore;

#[async_trait]
impl MetricsStore for LogStore {
    async fn save_metrics(&self, record: &MetricsRecord) -> MonitoringResult<()> {
        tracing::info!(
            session_id = %record.session_id,
            transport = %record.transport,
            chunks_sent = record.chunks_sent,
            chunks_received = record.chunks_received,
            buffer_underruns = record.buffer_underruns,
            reconnect_attempts = record.reconnect_attempts,
            latency_mean_ms = record.latency.mean_ms,
            latency_p95_ms = record.latency.p95_ms,
            "Session metrics"
        );
        Ok(())
    }

    async fn save_errors(&self, records: &[ErrorRecord]) -> MonitoringResult<()> {
        for record in records {
            tracing::info!(
                session_id = %record.session_id,
                kind = ?record.kind,
                retryable = record.retryable,
                "Session error: {}",
                record.message
            );
        }
        Ok(())
    }
}

/// In-memory store for tests and headless runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    metrics: Mutex<Vec<MetricsRecord>>,
    errors: Mutex<Vec<ErrorRecord>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes always fail
    pub fn failing() -> Self {
        let store = Self::default();
        store.failing.store(true, Ordering::SeqCst);
        store
    }

    pub fn metrics(&self) -> Vec<MetricsRecord> {
        self.metrics.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn check(&self) -> MonitoringResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MonitoringError::Store("memory store set to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn save_metrics(&self, record: &MetricsRecord) -> MonitoringResult<()> {
        self.check()?;
        self.metrics
            .lock()
            .map_err(|e| MonitoringError::Store(e.to_string()))?
            .push(record.clone());
        Ok(())
    }

    async fn save_errors(&self, records: &[ErrorRecord]) -> MonitoringResult<()> {
        self.check()?;
        self.errors
            .lock()
            .map_err(|e| MonitoringError::Store(e.to_string()))?
            .extend_from_slice(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::metrics::MetricsCollector;
    use crate::transport::{TransportError, TransportKind};

    #[tokio::test]
    async fn test_json_lines_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::new(
            dir.path().join("nested/metrics.jsonl"),
            dir.path().join("nested/errors.jsonl"),
        );

        let collector = MetricsCollector::new("s1", TransportKind::Relayed);
        collector.record_latency(100);
        collector.record_error(&TransportError::Timeout(10_000));
        let record = MetricsRecord::finalize(&collector);

        store.save_metrics(&record).await.unwrap();
        store.save_metrics(&record).await.unwrap();
        store.save_errors(&collector.errors()).await.unwrap();
        store.save_errors(&[]).await.unwrap();

        let metrics = tokio::fs::read_to_string(store.metrics_path()).await.unwrap();
        let lines: Vec<&str> = metrics.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: MetricsRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, record);

        let errors = tokio::fs::read_to_string(store.errors_path()).await.unwrap();
        assert_eq!(errors.lines().count(), 1);
        assert!(errors.contains("\"kind\":\"transport\""));
    }

    #[test]
    fn test_from_config() {
        assert!(JsonLinesStore::from_config(&MonitoringConfig::default()).is_none());

        let config = MonitoringConfig {
            metrics_path: Some(PathBuf::from("/tmp/voice/metrics.jsonl")),
            errors_path: None,
        };
        let store = JsonLinesStore::from_config(&config).unwrap();
        assert_eq!(store.errors_path(), Path::new("/tmp/voice/metrics.errors.jsonl"));
    }

    #[tokio::test]
    async fn test_memory_store_failing_mode() {
        let store = MemoryStore::failing();
        let record = MetricsRecord::finalize(&MetricsCollector::new("s1", TransportKind::Peer));
        assert!(store.save_metrics(&record).await.is_err());
        assert!(store.metrics().is_empty());
    }
}
