use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Everything we remember about a TiVo that has talked to us or been found by
/// the zeroconf scanner, keyed by TSN. Mirrors the `{address, port, name,
/// properties}` shape the original kept in its process-wide `tivos` dict.
#[derive(Clone, Debug)]
pub(crate) struct TivoRecord {
    pub(crate) tsn: String,
    pub(crate) address: String,
    pub(crate) port: u16,
    pub(crate) name: Option<String>,
    pub(crate) is_hd: bool,
    pub(crate) is_4k: bool,
    pub(crate) properties: HashMap<String, String>,
}

impl TivoRecord {
    pub(crate) fn new(tsn: String, address: String) -> TivoRecord {
        let is_hd = is_hd_tsn(&tsn);
        let is_4k = is_4k_tsn(&tsn);
        TivoRecord {
            tsn,
            address,
            port: 443,
            name: None,
            is_hd,
            is_4k,
            properties: HashMap::new(),
        }
    }
}

/// Shared map of TSN -> last known TiVo record, populated lazily as requests
/// and ToGo discovery come in. Analogous to the original's module-level
/// `tivos`/`tivos_found` globals in config.py, but scoped behind a handle
/// instead of process-global state.
#[derive(Clone, Default)]
pub(crate) struct TivoRegistry {
    inner: Arc<RwLock<HashMap<String, TivoRecord>>>,
}

impl TivoRegistry {
    pub(crate) fn new() -> TivoRegistry {
        TivoRegistry::default()
    }

    /// Inserts a freshly discovered record, or fills in the address/name of
    /// an existing one if they were previously unset -- augmenting rather
    /// than clobbering, per §3 ("augmented on first HTTP contact").
    pub(crate) async fn remember(&self, record: TivoRecord) {
        let mut guard = self.inner.write().await;
        match guard.get_mut(&record.tsn) {
            Some(existing) => {
                if existing.address.is_empty() {
                    existing.address = record.address;
                }
                if existing.name.is_none() {
                    existing.name = record.name;
                }
                for (k, v) in record.properties {
                    existing.properties.entry(k).or_insert(v);
                }
            }
            None => {
                guard.insert(record.tsn.clone(), record);
            }
        }
    }

    pub(crate) async fn get(&self, tsn: &str) -> Option<TivoRecord> {
        self.inner.read().await.get(tsn).cloned()
    }

    pub(crate) async fn known_tsns(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    /// Reverse lookup by IP address, used by the ToGo engine: enqueue
    /// requests name a TiVo by address, but the MAK/TSN-capability lookups
    /// are keyed by TSN.
    pub(crate) async fn find_by_address(&self, address: &str) -> Option<TivoRecord> {
        self.inner
            .read()
            .await
            .values()
            .find(|r| r.address == address)
            .cloned()
    }

    pub(crate) async fn all(&self) -> Vec<TivoRecord> {
        self.inner.read().await.values().cloned().collect()
    }
}

pub(crate) fn is_hd_tsn(tsn: &str) -> bool {
    !tsn.starts_with('1') && !tsn.starts_with("2400") && !tsn.starts_with("2")
}

pub(crate) fn is_4k_tsn(tsn: &str) -> bool {
    tsn.starts_with('8') || tsn.starts_with('9')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remember_and_get() {
        let reg = TivoRegistry::new();
        reg.remember(TivoRecord::new(
            "746000000001234".to_string(),
            "192.168.1.50".to_string(),
        ))
        .await;
        let Some(rec) = reg.get("746000000001234").await else {
            panic!("expected record to be present");
        };
        assert_eq!(rec.address, "192.168.1.50");
        assert!(reg.get("000").await.is_none());
    }

    #[tokio::test]
    async fn test_remember_augments_without_clobbering() {
        let reg = TivoRegistry::new();
        let mut first = TivoRecord::new("746000000001234".to_string(), String::new());
        first.name = None;
        reg.remember(first).await;

        let mut second = TivoRecord::new("746000000001234".to_string(), "10.0.0.5".to_string());
        second.name = Some("Living Room".to_string());
        reg.remember(second).await;

        let Some(rec) = reg.get("746000000001234").await else {
            panic!("expected record to be present");
        };
        assert_eq!(rec.address, "10.0.0.5");
        assert_eq!(rec.name.as_deref(), Some("Living Room"));
    }

    #[tokio::test]
    async fn test_find_by_address() {
        let reg = TivoRegistry::new();
        reg.remember(TivoRecord::new(
            "746000000001234".to_string(),
            "192.168.1.50".to_string(),
        ))
        .await;
        let Some(rec) = reg.find_by_address("192.168.1.50").await else {
            panic!("expected a record for that address");
        };
        assert_eq!(rec.tsn, "746000000001234");
        assert!(reg.find_by_address("10.0.0.1").await.is_none());
    }

    #[test]
    fn test_4k_tsn() {
        assert!(is_4k_tsn("846000000001234"));
        assert!(!is_4k_tsn("746000000001234"));
    }
}
