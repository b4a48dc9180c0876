use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;

/// Direction a status entry describes, so the JSON control API can project
/// uploads (serving to a TiVo) and downloads (ToGo pulls) into one table the
/// way the original's `Status` class did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TransferDirection {
    Upload,
    Download,
}

#[derive(Clone, Debug)]
pub(crate) struct TransferStatus {
    pub(crate) direction: TransferDirection,
    pub(crate) name: String,
    pub(crate) tsn: String,
    pub(crate) total_bytes: Option<u64>,
    pub(crate) sent_bytes: u64,
    pub(crate) rate_bytes_per_sec: f64,
    pub(crate) started: Instant,
    pub(crate) last_update: Instant,
    pub(crate) done: bool,
    pub(crate) error: Option<String>,
}

impl TransferStatus {
    pub(crate) fn new(direction: TransferDirection, name: String, tsn: String) -> TransferStatus {
        let now = Instant::now();
        TransferStatus {
            direction,
            name,
            tsn,
            total_bytes: None,
            sent_bytes: 0,
            rate_bytes_per_sec: 0.0,
            started: now,
            last_update: now,
            done: false,
            error: None,
        }
    }
}

/// JSON-serializable projection of a `TransferStatus`, for the admin/control
/// surface's status endpoint -- `Instant` itself isn't serializable, so
/// timestamps are flattened to elapsed seconds at projection time.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct TransferStatusView {
    pub(crate) direction: TransferDirection,
    pub(crate) name: String,
    pub(crate) tsn: String,
    pub(crate) total_bytes: Option<u64>,
    pub(crate) sent_bytes: u64,
    pub(crate) rate_bytes_per_sec: f64,
    pub(crate) elapsed_secs: f64,
    pub(crate) done: bool,
    pub(crate) error: Option<String>,
}

impl From<&TransferStatus> for TransferStatusView {
    fn from(status: &TransferStatus) -> TransferStatusView {
        TransferStatusView {
            direction: status.direction,
            name: status.name.clone(),
            tsn: status.tsn.clone(),
            total_bytes: status.total_bytes,
            sent_bytes: status.sent_bytes,
            rate_bytes_per_sec: status.rate_bytes_per_sec,
            elapsed_secs: status.started.elapsed().as_secs_f64(),
            done: status.done,
            error: status.error.clone(),
        }
    }
}

/// Shared transfer status table, swept for entries older than 24 hours the
/// way `cleanup_status()` in the original's video plugin did.
#[derive(Clone, Default)]
pub(crate) struct StatusRegistry {
    inner: Arc<RwLock<HashMap<String, TransferStatus>>>,
}

const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

impl StatusRegistry {
    pub(crate) fn new() -> StatusRegistry {
        StatusRegistry::default()
    }

    pub(crate) async fn insert(&self, key: String, status: TransferStatus) {
        self.inner.write().await.insert(key, status);
    }

    pub(crate) async fn update<F>(&self, key: &str, f: F)
    where
        F: FnOnce(&mut TransferStatus),
    {
        let mut guard = self.inner.write().await;
        if let Some(status) = guard.get_mut(key) {
            f(status);
            status.last_update = Instant::now();
        }
    }

    pub(crate) async fn get(&self, key: &str) -> Option<TransferStatus> {
        self.inner.read().await.get(key).cloned()
    }

    pub(crate) async fn remove(&self, key: &str) {
        self.inner.write().await.remove(key);
    }

    pub(crate) async fn all(&self) -> Vec<TransferStatus> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Drop entries whose last update is older than 24 hours. Intended to run
    /// on a periodic tick from the main task set.
    pub(crate) async fn sweep_stale(&self) {
        let now = Instant::now();
        let mut guard = self.inner.write().await;
        guard.retain(|_, status| now.duration_since(status.last_update) < STALE_AFTER);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_update_get() {
        let reg = StatusRegistry::new();
        reg.insert(
            "job1".to_string(),
            TransferStatus::new(TransferDirection::Download, "show.ts".to_string(), "123".to_string()),
        )
        .await;
        reg.update("job1", |s| s.sent_bytes = 4096).await;
        let Some(status) = reg.get("job1").await else {
            panic!("expected status to be present");
        };
        assert_eq!(status.sent_bytes, 4096);
    }

    #[tokio::test]
    async fn test_remove() {
        let reg = StatusRegistry::new();
        reg.insert(
            "job1".to_string(),
            TransferStatus::new(TransferDirection::Upload, "show.ts".to_string(), "123".to_string()),
        )
        .await;
        reg.remove("job1").await;
        assert!(reg.get("job1").await.is_none());
    }
}
