//! Live relay connections
//!
//! Each bridged pair writes only its own entry; the inactivity sweep only
//! reads. The registry belongs to one [`RelayServer`](super::RelayServer)
//! and is cleared when that server shuts down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::profile::Language;

/// State of one bridged client/upstream pair
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConnectionInfo {
    pub id: Uuid,
    pub user_id: String,
    pub language: Language,
    pub model: String,
    pub started_at: DateTime<Utc>,
    /// Estimated tokens of user audio sent upstream
    pub inbound_tokens: f64,
    /// Estimated tokens of tutor audio sent to the client
    pub outbound_tokens: f64,
    #[serde(skip)]
    pub started: Instant,
    #[serde(skip)]
    pub last_activity: Instant,
}

impl RelayConnectionInfo {
    pub fn new(user_id: impl Into<String>, language: Language, model: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            language,
            model: model.into(),
            started_at: Utc::now(),
            inbound_tokens: 0.0,
            outbound_tokens: 0.0,
            started: now,
            last_activity: now,
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Registry of live relay connections
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, RelayConnectionInfo>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry and return its id
    pub async fn register(&self, info: RelayConnectionInfo) -> Uuid {
        let id = info.id;
        self.inner.write().await.insert(id, info);
        id
    }

    /// Record activity on `id`
    pub async fn touch(&self, id: Uuid) {
        if let Some(info) = self.inner.write().await.get_mut(&id) {
            info.last_activity = Instant::now();
        }
    }

    /// Add usage estimates and record activity
    pub async fn add_usage(&self, id: Uuid, inbound_tokens: f64, outbound_tokens: f64) {
        if let Some(info) = self.inner.write().await.get_mut(&id) {
            info.inbound_tokens += inbound_tokens;
            info.outbound_tokens += outbound_tokens;
            info.last_activity = Instant::now();
        }
    }

    pub async fn remove(&self, id: Uuid) -> Option<RelayConnectionInfo> {
        self.inner.write().await.remove(&id)
    }

    pub async fn get(&self, id: Uuid) -> Option<RelayConnectionInfo> {
        self.inner.read().await.get(&id).cloned()
    }

    /// Snapshot of every live entry
    pub async fn connections(&self) -> Vec<RelayConnectionInfo> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Connections idle for longer than `threshold`, with their idle time
    pub async fn inactive(&self, threshold: Duration) -> Vec<(Uuid, Duration)> {
        self.inner
            .read()
            .await
            .values()
            .filter_map(|info| {
                let idle = info.idle_for();
                (idle > threshold).then_some((info.id, idle))
            })
            .collect()
    }

    /// Drop every entry; returns how many were live
    pub async fn clear(&self) -> usize {
        let mut guard = self.inner.write().await;
        let count = guard.len();
        guard.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_register_touch_and_inactive() {
        let registry = ConnectionRegistry::new();
        let quiet = registry
            .register(RelayConnectionInfo::new("kid-1", Language::English, "m"))
            .await;
        let busy = registry
            .register(RelayConnectionInfo::new("kid-2", Language::Spanish, "m"))
            .await;
        assert_eq!(registry.len().await, 2);

        tokio::time::advance(Duration::from_secs(200)).await;
        registry.touch(busy).await;
        tokio::time::advance(Duration::from_secs(150)).await;

        let inactive = registry.inactive(Duration::from_secs(300)).await;
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].0, quiet);
        assert_eq!(inactive[0].1, Duration::from_secs(350));
    }

    #[tokio::test]
    async fn test_usage_accumulates_per_entry() {
        let registry = ConnectionRegistry::new();
        let id = registry
            .register(RelayConnectionInfo::new("kid-1", Language::English, "m"))
            .await;

        registry.add_usage(id, 50.0, 0.0).await;
        registry.add_usage(id, 0.0, 25.0).await;
        registry.add_usage(Uuid::new_v4(), 1000.0, 1000.0).await;

        let info = registry.get(id).await.unwrap();
        assert_eq!(info.inbound_tokens, 50.0);
        assert_eq!(info.outbound_tokens, 25.0);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let registry = ConnectionRegistry::new();
        let id = registry
            .register(RelayConnectionInfo::new("kid-1", Language::English, "m"))
            .await;
        registry
            .register(RelayConnectionInfo::new("kid-2", Language::English, "m"))
            .await;

        assert_eq!(registry.remove(id).await.unwrap().user_id, "kid-1");
        assert!(registry.remove(id).await.is_none());
        assert_eq!(registry.clear().await, 1);
        assert!(registry.is_empty().await);
    }
}
