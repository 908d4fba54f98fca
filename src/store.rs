//! Persistence of pool records across restarts.
//!
//! The pool only talks to storage through [`ProxyStore`]: a full load per
//! pool at startup, periodic upserts of every record, and bulk removals.

use crate::error::StoreError;
use crate::proxy::StoredProxy;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub inserted: usize,
    pub updated: usize,
}

/// Document storage backing the pools.
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Every stored record of a pool.
    async fn load_all(&self, pool: &str) -> Result<Vec<StoredProxy>, StoreError>;

    /// Upsert records keyed by (pool, proxy).
    async fn save_all(&self, pool: &str, records: Vec<StoredProxy>) -> Result<SaveReport, StoreError>;

    /// Delete records and return how many existed.
    async fn remove_many(&self, pool: &str, proxies: &[String]) -> Result<usize, StoreError>;
}

type Documents = BTreeMap<String, StoredProxy>;

fn upsert(documents: &mut Documents, records: Vec<StoredProxy>) -> SaveReport {
    let mut report = SaveReport::default();
    for record in records {
        match documents.insert(record.proxy.clone(), record) {
            Some(_) => report.updated += 1,
            None => report.inserted += 1,
        }
    }
    report
}

fn remove(documents: &mut Documents, proxies: &[String]) -> usize {
    proxies
        .iter()
        .filter(|proxy| documents.remove(proxy.as_str()).is_some())
        .count()
}

/// In-process store, used when nothing has to survive a restart.
#[derive(Debug)]
pub struct MemoryStore {
    pools: Mutex<HashMap<String, Documents>>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StoreError::Unavailable` until switched
    /// back on.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        }
    }

    /// Number of stored records of a pool.
    pub fn len(&self, pool: &str) -> usize {
        self.pools.lock().get(pool).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, pool: &str) -> bool {
        self.len(pool) == 0
    }
}

#[async_trait]
impl ProxyStore for MemoryStore {
    async fn load_all(&self, pool: &str) -> Result<Vec<StoredProxy>, StoreError> {
        self.check()?;
        Ok(self
            .pools
            .lock()
            .get(pool)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_all(&self, pool: &str, records: Vec<StoredProxy>) -> Result<SaveReport, StoreError> {
        self.check()?;
        let mut pools = self.pools.lock();
        Ok(upsert(pools.entry(pool.to_string()).or_default(), records))
    }

    async fn remove_many(&self, pool: &str, proxies: &[String]) -> Result<usize, StoreError> {
        self.check()?;
        let mut pools = self.pools.lock();
        Ok(pools
            .get_mut(pool)
            .map_or(0, |documents| remove(documents, proxies)))
    }
}

/// One JSON document per pool inside a directory.
///
/// Writes go to a temporary file that is renamed over the old one, so a
/// crash never leaves a half-written pool behind.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// File of a pool. Bytes other than ASCII letters, digits, `-` and `_`
    /// are percent-encoded, so distinct pool names never share a file.
    fn pool_path(&self, pool: &str) -> PathBuf {
        let mut name = String::with_capacity(pool.len());
        for byte in pool.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                name.push(char::from(byte));
            } else {
                let _ = write!(name, "%{:02X}", byte);
            }
        }
        self.dir.join(format!("{}.json", name))
    }

    async fn read(&self, pool: &str) -> Result<Documents, StoreError> {
        let path = self.pool_path(pool);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no stored records for [{}] at {}", pool, path.display());
                return Ok(Documents::new());
            }
            Err(e) => return Err(e.into()),
        };
        let records: Vec<StoredProxy> = serde_json::from_slice(&content)?;
        Ok(records
            .into_iter()
            .map(|record| (record.proxy.clone(), record))
            .collect())
    }

    async fn write(&self, pool: &str, documents: &Documents) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.pool_path(pool);
        let tmp = path.with_extension("json.tmp");
        let records: Vec<&StoredProxy> = documents.values().collect();
        fs::write(&tmp, serde_json::to_vec_pretty(&records)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl ProxyStore for JsonFileStore {
    async fn load_all(&self, pool: &str) -> Result<Vec<StoredProxy>, StoreError> {
        Ok(self.read(pool).await?.into_values().collect())
    }

    async fn save_all(&self, pool: &str, records: Vec<StoredProxy>) -> Result<SaveReport, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut documents = self.read(pool).await?;
        let report = upsert(&mut documents, records);
        self.write(pool, &documents).await?;
        Ok(report)
    }

    async fn remove_many(&self, pool: &str, proxies: &[String]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut documents = self.read(pool).await?;
        let removed = remove(&mut documents, proxies);
        if removed > 0 {
            self.write(pool, &documents).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ProxyRecord, ProxyStatus};

    fn stored(proxy: &str, status: ProxyStatus, good_attempts: i32) -> StoredProxy {
        StoredProxy {
            pool: "p".to_string(),
            proxy: proxy.to_string(),
            status,
            record: ProxyRecord {
                good_attempts,
                ..ProxyRecord::default()
            },
        }
    }

    #[tokio::test]
    async fn memory_store_upserts() {
        let store = MemoryStore::new();
        let report = store
            .save_all("p", vec![stored("a:1", ProxyStatus::Good, 1), stored("b:1", ProxyStatus::Dead, 0)])
            .await
            .unwrap();
        assert_eq!(report, SaveReport { inserted: 2, updated: 0 });

        let report = store
            .save_all("p", vec![stored("a:1", ProxyStatus::Busy, 2), stored("c:1", ProxyStatus::Unchecked, 0)])
            .await
            .unwrap();
        assert_eq!(report, SaveReport { inserted: 1, updated: 1 });
        assert_eq!(store.len("p"), 3);

        let loaded = store.load_all("p").await.unwrap();
        let a = loaded.iter().find(|r| r.proxy == "a:1").unwrap();
        assert_eq!(a.status, ProxyStatus::Busy);
        assert_eq!(a.record.good_attempts, 2);
    }

    #[test]
    fn memory_store_can_be_switched_off() {
        let store = MemoryStore::new();
        store.set_available(false);
        let result = tokio_test::block_on(store.load_all("p"));
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        store.set_available(true);
        assert!(tokio_test::block_on(store.load_all("p")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn json_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("pools"));

        assert!(store.load_all("shop").await.unwrap().is_empty());

        store
            .save_all("shop", vec![stored("a:1", ProxyStatus::Good, 3), stored("b:1", ProxyStatus::Dead, 0)])
            .await
            .unwrap();
        let report = store
            .save_all("shop", vec![stored("a:1", ProxyStatus::Postponed, 4)])
            .await
            .unwrap();
        assert_eq!(report, SaveReport { inserted: 0, updated: 1 });

        let removed = store
            .remove_many("shop", &["b:1".to_string(), "zz:1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let reopened = JsonFileStore::new(dir.path().join("pools"));
        let loaded = reopened.load_all("shop").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, ProxyStatus::Postponed);
        assert_eq!(loaded[0].record.good_attempts, 4);
    }

    #[tokio::test]
    async fn json_store_rejects_corrupt_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        std::fs::write(dir.path().join("p.json"), b"{not json").unwrap();
        assert!(matches!(store.load_all("p").await, Err(StoreError::Json(_))));
    }

    #[test]
    fn pool_names_become_safe_file_names() {
        let store = JsonFileStore::new("/data");
        assert_eq!(store.pool_path("shop/../x"), PathBuf::from("/data/shop%2F%2E%2E%2Fx.json"));
        assert_eq!(store.pool_path("news-1_a"), PathBuf::from("/data/news-1_a.json"));
        assert_eq!(store.pool_path("ü"), PathBuf::from("/data/%C3%BC.json"));
    }

    #[test]
    fn similar_pool_names_get_distinct_files() {
        let store = JsonFileStore::new("/data");
        let names = ["a.b", "a_b", "a b", "a%2Eb", "a/b"];
        let paths: std::collections::HashSet<PathBuf> =
            names.iter().map(|name| store.pool_path(name)).collect();
        assert_eq!(paths.len(), names.len());
    }
}
