//! Session telemetry
//!
//! Counts chunks, underruns, reconnects and response latencies for one
//! session and persists them when the session ends. Persistence failures
//! are logged and never surface to the caller.

/// Monitoring error types
pub mod error;

/// Counters, latency statistics and records
pub mod metrics;

/// Transport wrapper and counting listener
pub mod monitor;

/// Persistence backends
pub mod store;

pub use error::{MonitoringError, MonitoringResult};
pub use metrics::{ErrorRecord, LatencyStats, MetricsCollector, MetricsRecord, percentile};
pub use monitor::{MonitoredTransport, SessionMonitor};
pub use store::{JsonLinesStore, LogStore, MemoryStore, MetricsStore};
