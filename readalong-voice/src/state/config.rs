//! Voice layer configuration
//!
//! Loads and saves [`AppConfig`] as JSON. Every section is `#[serde(default)]`
//! so a partial file only overrides what it names.
//!
//! # Storage location
//!
//! - Windows: `%APPDATA%/readalong/voice.json`
//! - macOS: `~/Library/Application Support/readalong/voice.json`
//! - Linux: `~/.config/readalong/voice.json`
//!
//! # Example
//!
//! ```no_run
//! use readalong_voice_lib::state::config::{ConfigManager, GlobalConfig};
//!
//! let path = ConfigManager::default_path().unwrap();
//! let config = ConfigManager::load(&path).unwrap();
//! let global = GlobalConfig::new(config);
//! assert_eq!(global.get().relay.batch_interval_ms, 50);
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reconnect::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RECONNECT_SCHEDULE_MS, ReconnectPolicy};
use crate::transport::TransportKind;

/// Environment variable that overrides `provider.api_key` at load time
pub const API_KEY_ENV: &str = "REALTIME_API_KEY";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Could not resolve a config path
    #[error("Path error: {0}")]
    Path(String),

    /// A value is out of its accepted range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Upstream realtime provider
    pub provider: ProviderConfig,
    /// Relay bridge server
    pub relay: RelayConfig,
    /// Credential issuance
    pub credentials: CredentialsConfig,
    /// Client-side audio
    pub audio: AudioConfig,
    /// Reconnection schedule
    pub reconnect: ReconnectConfig,
    /// Transport selection
    pub transport: TransportConfig,
    /// Metrics persistence
    pub monitoring: MonitoringConfig,
}

impl AppConfig {
    /// Check values that would make the voice layer misbehave
    pub fn validate(&self) -> ConfigResult<()> {
        if self.relay.batch_interval_ms == 0 {
            return Err(ConfigError::Invalid("relay.batch_interval_ms must be > 0".into()));
        }
        if self.relay.heartbeat_interval_secs == 0 || self.relay.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("relay intervals must be > 0".into()));
        }
        if self.credentials.max_requests == 0 || self.credentials.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "credentials.max_requests and window_secs must be > 0".into(),
            ));
        }
        if self.reconnect.schedule_ms.is_empty() {
            return Err(ConfigError::Invalid("reconnect.schedule_ms must not be empty".into()));
        }
        if self.audio.frame_ms == 0 || self.audio.sample_rate == 0 {
            return Err(ConfigError::Invalid("audio.frame_ms and sample_rate must be > 0".into()));
        }
        Ok(())
    }
}

/// Realtime provider settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider API key (server-side only)
    pub api_key: String,
    /// Realtime model id
    pub model: String,
    /// Realtime websocket endpoint
    pub realtime_url: String,
    /// Endpoint that mints ephemeral client secrets
    pub sessions_url: String,
    /// Endpoint that accepts SDP offers
    pub calls_url: String,
    /// Model used for input audio transcription
    pub transcription_model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o-realtime-preview".to_string(),
            realtime_url: "wss://api.openai.com/v1/realtime".to_string(),
            sessions_url: "https://api.openai.com/v1/realtime/sessions".to_string(),
            calls_url: "https://api.openai.com/v1/realtime".to_string(),
            transcription_model: "whisper-1".to_string(),
        }
    }
}

impl ProviderConfig {
    /// Whether an API key is configured
    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Relay bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address
    pub bind: String,
    /// Listen port (0 picks a free port)
    pub port: u16,
    /// URL clients use to reach `/relay`
    pub public_url: String,
    /// Audio batch flush interval
    pub batch_interval_ms: u64,
    /// Upstream ping interval
    pub heartbeat_interval_secs: u64,
    /// Inactivity sweep interval
    pub sweep_interval_secs: u64,
    /// Inactivity reported by the sweep
    pub inactivity_threshold_secs: u64,
    /// Sampling temperature sent in the session bootstrap
    pub temperature: f32,
    /// Output token cap sent in the session bootstrap
    pub max_response_output_tokens: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
            public_url: "ws://127.0.0.1:8787/relay".to_string(),
            batch_interval_ms: 50,
            heartbeat_interval_secs: 30,
            sweep_interval_secs: 60,
            inactivity_threshold_secs: 300,
            temperature: 0.8,
            max_response_output_tokens: 4096,
        }
    }
}

impl RelayConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }
}

/// Credential rate limit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Credentials allowed per caller per window
    pub max_requests: usize,
    /// Rolling window length
    pub window_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 60,
        }
    }
}

impl CredentialsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Client audio settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Wire sample rate
    pub sample_rate: u32,
    /// Outbound PCM16 frame length
    pub frame_ms: u32,
    /// Input device name (None means system default)
    pub input_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            frame_ms: 40,
            input_device: None,
        }
    }
}

/// Reconnection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Fixed delay schedule in milliseconds
    pub schedule_ms: Vec<u64>,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            schedule_ms: DEFAULT_RECONNECT_SCHEDULE_MS.to_vec(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectConfig {
    /// Build the policy used by the reconnection manager
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.schedule_ms.clone(), self.max_attempts)
    }
}

/// Transport selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Which transport implementation to use
    pub kind: TransportKind,
    /// Bound on connect/negotiation
    pub connect_timeout_ms: u64,
    /// STUN/TURN urls for the peer transport's media engine
    pub ice_servers: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Relayed,
            connect_timeout_ms: 10_000,
            ice_servers: Vec::new(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Metrics persistence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// JSON-lines file receiving one metrics record per session
    pub metrics_path: Option<PathBuf>,
    /// JSON-lines file receiving error records
    pub errors_path: Option<PathBuf>,
}

/// Loads and saves configuration files
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from `path`
    ///
    /// A missing file yields defaults. `REALTIME_API_KEY` overrides the
    /// provider key when set and non-empty.
    pub fn load(path: &Path) -> ConfigResult<AppConfig> {
        tracing::debug!(path = %path.display(), "Loading config");

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: AppConfig = serde_json::from_str(&content)?;
            tracing::info!(path = %path.display(), "Config loaded");
            config
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            AppConfig::default()
        };

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            Self::apply_api_key_override(&mut config, Some(key));
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save(path: &Path, config: &AppConfig) -> ConfigResult<()> {
        tracing::debug!(path = %path.display(), "Saving config");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(path, content)?;

        tracing::info!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Platform config file location
    pub fn default_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("readalong").join("voice.json"))
            .ok_or_else(|| ConfigError::Path("no platform config directory".to_string()))
    }

    /// Apply an API key override; empty values are ignored
    pub fn apply_api_key_override(config: &mut AppConfig, key: Option<String>) {
        if let Some(key) = key.filter(|k| !k.trim().is_empty()) {
            tracing::debug!("Provider API key taken from environment");
            config.provider.api_key = key;
        }
    }
}

/// Shared configuration with lock-free reads
pub struct GlobalConfig {
    config: ArcSwap<AppConfig>,
}

impl GlobalConfig {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: ArcSwap::new(Arc::new(config)),
        }
    }

    /// Current configuration snapshot
    pub fn get(&self) -> Arc<AppConfig> {
        self.config.load_full()
    }

    /// Replace the configuration atomically
    pub fn update(&self, config: AppConfig) {
        self.config.store(Arc::new(config));
    }

    /// Replace only the provider API key
    pub fn set_api_key(&self, api_key: String) {
        self.config.rcu(|current| {
            let mut next = (**current).clone();
            next.provider.api_key = api_key.clone();
            next
        });
    }

    pub fn has_api_key(&self) -> bool {
        self.config.load().provider.has_api_key()
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();

        assert!(config.provider.api_key.is_empty());
        assert_eq!(config.relay.batch_interval_ms, 50);
        assert_eq!(config.relay.heartbeat_interval_secs, 30);
        assert_eq!(config.relay.inactivity_threshold_secs, 300);
        assert_eq!(config.relay.max_response_output_tokens, 4096);
        assert_eq!(config.credentials.max_requests, 10);
        assert_eq!(config.credentials.window_secs, 60);
        assert_eq!(config.audio.sample_rate, 24_000);
        assert_eq!(config.reconnect.schedule_ms, vec![500, 1000, 2000, 3000, 5000]);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.transport.kind, TransportKind::Relayed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_partial_json() {
        let json = r#"{
            "provider": { "api_key": "sk-test" },
            "transport": { "kind": "peer" }
        }"#;

        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.provider.api_key, "sk-test");
        assert_eq!(config.provider.model, "gpt-4o-realtime-preview");
        assert_eq!(config.transport.kind, TransportKind::Peer);
        assert_eq!(config.transport.connect_timeout_ms, 10_000);
        assert!(config.transport.ice_servers.is_empty());
        assert_eq!(config.relay.batch_interval_ms, 50);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = AppConfig::default();
        config.relay.batch_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.reconnect.schedule_ms.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("voice.json");

        let mut config = AppConfig::default();
        config.relay.port = 9100;
        config.monitoring.metrics_path = Some(dir.path().join("metrics.jsonl"));

        ConfigManager::save(&path, &config).unwrap();
        let loaded = ConfigManager::load(&path).unwrap();

        assert_eq!(loaded.relay.port, 9100);
        assert_eq!(loaded.monitoring.metrics_path, config.monitoring.metrics_path);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigManager::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.relay.port, 8787);
    }

    #[test]
    fn test_api_key_override() {
        let mut config = AppConfig::default();

        ConfigManager::apply_api_key_override(&mut config, Some("  ".to_string()));
        assert!(!config.provider.has_api_key());

        ConfigManager::apply_api_key_override(&mut config, Some("sk-env".to_string()));
        assert_eq!(config.provider.api_key, "sk-env");
    }

    #[test]
    fn test_global_config_update() {
        let global = GlobalConfig::default();
        assert!(!global.has_api_key());

        global.set_api_key("sk-live".to_string());
        assert!(global.has_api_key());

        let mut next = AppConfig::default();
        next.relay.port = 1;
        global.update(next);
        assert_eq!(global.get().relay.port, 1);
        assert!(!global.has_api_key());
    }
}
