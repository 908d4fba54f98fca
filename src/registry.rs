//! Per-pool storage of proxy health records.
//!
//! The registry owns every [`ProxyRecord`] and hides them behind one
//! reader/writer lock over the whole pool-keyed map. Each call takes the lock
//! once and releases it before returning, so a record mutation is always a
//! single critical section.
//!
//! Lookups on a pool or proxy that is not present return `None` or `false`.
//! A proxy can vanish between two calls when it is removed concurrently, and
//! callers treat that as a normal outcome.

use crate::proxy::ProxyRecord;

use parking_lot::RwLock;
use std::collections::HashMap;

type PoolRecords = HashMap<String, ProxyRecord>;

/// Storage of proxy records keyed by pool and proxy address.
#[derive(Debug, Default)]
pub struct Registry {
    pools: RwLock<HashMap<String, PoolRecords>>,
}

impl Registry {
    /// Create a registry tracking the given pools.
    pub fn new<I, S>(pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pools = pools
            .into_iter()
            .map(|pool| (pool.into(), HashMap::new()))
            .collect();
        Self {
            pools: RwLock::new(pools),
        }
    }

    pub fn has_pool(&self, pool: &str) -> bool {
        self.pools.read().contains_key(pool)
    }

    /// Number of proxies in a pool.
    pub fn len(&self, pool: &str) -> usize {
        self.pools.read().get(pool).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self, pool: &str) -> bool {
        self.len(pool) == 0
    }

    fn read<R>(&self, pool: &str, proxy: &str, f: impl FnOnce(&ProxyRecord) -> R) -> Option<R> {
        let pools = self.pools.read();
        pools.get(pool)?.get(proxy).map(f)
    }

    fn update<R>(
        &self,
        pool: &str,
        proxy: &str,
        f: impl FnOnce(&mut ProxyRecord) -> R,
    ) -> Option<R> {
        let mut pools = self.pools.write();
        pools.get_mut(pool)?.get_mut(proxy).map(f)
    }

    /// Store a record, replacing any previous one. Returns `false` when the
    /// pool is not tracked.
    pub fn put(&self, pool: &str, proxy: &str, record: ProxyRecord) -> bool {
        let mut pools = self.pools.write();
        match pools.get_mut(pool) {
            Some(records) => {
                records.insert(proxy.to_string(), record);
                true
            }
            None => false,
        }
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&self, pool: &str, proxy: &str) -> bool {
        let mut pools = self.pools.write();
        pools
            .get_mut(pool)
            .is_some_and(|records| records.remove(proxy).is_some())
    }

    pub fn exists(&self, pool: &str, proxy: &str) -> bool {
        self.read(pool, proxy, |_| ()).is_some()
    }

    /// Copy of a single record.
    pub fn get(&self, pool: &str, proxy: &str) -> Option<ProxyRecord> {
        self.read(pool, proxy, |record| *record)
    }

    pub fn start_time(&self, pool: &str, proxy: &str) -> Option<i64> {
        self.read(pool, proxy, |record| record.start_get_proxy_time)
    }

    pub fn reset_start_time(&self, pool: &str, proxy: &str, now: i64) -> bool {
        self.update(pool, proxy, |record| record.start_get_proxy_time = now)
            .is_some()
    }

    /// Set the start time only when it is unset. Returns the start time in
    /// effect afterwards.
    pub fn stamp_start_time(&self, pool: &str, proxy: &str, now: i64) -> Option<i64> {
        self.update(pool, proxy, |record| {
            if record.start_get_proxy_time == 0 {
                record.start_get_proxy_time = now;
            }
            record.start_get_proxy_time
        })
    }

    /// Count a successful use and return the new good-attempt count.
    pub fn inc_good_attempt(&self, pool: &str, proxy: &str, now: i64) -> Option<i32> {
        self.update(pool, proxy, |record| {
            record.good_attempts += 1;
            record.number_of_successful_uses += 1;
            record.last_successfully_used = now;
            record.good_attempts
        })
    }

    /// Count a failed use and return the new failed-attempt count.
    pub fn inc_failure(&self, pool: &str, proxy: &str, now: i64) -> Option<i32> {
        self.update(pool, proxy, |record| {
            record.failed_attempts += 1;
            record.number_of_failures += 1;
            record.last_failure_used = now;
            record.failed_attempts
        })
    }

    pub fn failure_count(&self, pool: &str, proxy: &str) -> Option<i32> {
        self.read(pool, proxy, |record| record.failed_attempts)
    }

    pub fn next_check(&self, pool: &str, proxy: &str) -> Option<i64> {
        self.read(pool, proxy, |record| record.next_check)
    }

    pub fn set_next_check(&self, pool: &str, proxy: &str, next_check: i64) -> bool {
        self.update(pool, proxy, |record| record.next_check = next_check)
            .is_some()
    }

    /// Reset good attempts, start time and next check.
    ///
    /// This only touches the record. Returning the proxy to `unchecked` is
    /// the caller's job.
    pub fn clear_all(&self, pool: &str, proxy: &str) -> bool {
        self.update(pool, proxy, |record| {
            record.good_attempts = 0;
            record.start_get_proxy_time = 0;
            record.next_check = 0;
        })
        .is_some()
    }

    pub fn clear_good_attempts(&self, pool: &str, proxy: &str) -> bool {
        self.update(pool, proxy, |record| record.good_attempts = 0)
            .is_some()
    }

    pub fn clear_next_check(&self, pool: &str, proxy: &str) -> bool {
        self.update(pool, proxy, |record| record.next_check = 0)
            .is_some()
    }

    pub fn clear_failed_attempts(&self, pool: &str, proxy: &str) -> bool {
        self.update(pool, proxy, |record| record.failed_attempts = 0)
            .is_some()
    }

    /// Zero the usage telemetry of every proxy in every pool. Status and
    /// backoff state are left alone.
    pub fn clear_usage_telemetry(&self) {
        let mut pools = self.pools.write();
        for record in pools.values_mut().flat_map(HashMap::values_mut) {
            record.last_successfully_used = 0;
            record.number_of_successful_uses = 0;
            record.last_failure_used = 0;
            record.number_of_failures = 0;
        }
    }

    /// Create default records for addresses not yet in the pool and return
    /// the ones that were actually added. Existing records are untouched.
    pub fn insert_new<'a, I>(&self, pool: &str, addresses: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut pools = self.pools.write();
        let Some(records) = pools.get_mut(pool) else {
            return Vec::new();
        };

        let mut added = Vec::new();
        for address in addresses {
            if records.contains_key(address) {
                continue;
            }
            records.insert(address.to_string(), ProxyRecord::default());
            added.push(address.to_string());
        }
        added
    }

    /// Delete several records at once and return the addresses that existed.
    pub fn remove_many(&self, pool: &str, addresses: &[String]) -> Vec<String> {
        let mut pools = self.pools.write();
        let Some(records) = pools.get_mut(pool) else {
            return Vec::new();
        };
        addresses
            .iter()
            .filter(|address| records.remove(address.as_str()).is_some())
            .cloned()
            .collect()
    }

    /// Copy of every record in a pool.
    pub fn snapshot(&self, pool: &str) -> Vec<(String, ProxyRecord)> {
        let pools = self.pools.read();
        pools
            .get(pool)
            .map(|records| {
                records
                    .iter()
                    .map(|(proxy, record)| (proxy.clone(), *record))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(["p", "q"])
    }

    #[test]
    fn insert_new_is_idempotent() {
        let registry = registry();
        let added = registry.insert_new("p", ["a:1", "b:2", "a:1"]);
        assert_eq!(added, vec!["a:1".to_string(), "b:2".to_string()]);

        registry.inc_good_attempt("p", "a:1", 100);
        let added = registry.insert_new("p", ["a:1", "c:3"]);
        assert_eq!(added, vec!["c:3".to_string()]);
        assert_eq!(registry.get("p", "a:1").unwrap().good_attempts, 1);
        assert_eq!(registry.len("p"), 3);
        assert!(registry.is_empty("q"));
    }

    #[test]
    fn unknown_pool_or_proxy_is_a_no_op() {
        let registry = registry();
        assert!(!registry.put("missing", "a:1", ProxyRecord::default()));
        assert!(registry.insert_new("missing", ["a:1"]).is_empty());
        assert_eq!(registry.inc_good_attempt("p", "nope", 1), None);
        assert_eq!(registry.inc_failure("p", "nope", 1), None);
        assert!(!registry.set_next_check("p", "nope", 5));
        assert!(!registry.clear_all("p", "nope"));
        assert!(!registry.delete("p", "nope"));
        assert_eq!(registry.start_time("missing", "a:1"), None);
    }

    #[test]
    fn counters_and_stamps() {
        let registry = registry();
        registry.insert_new("p", ["a:1"]);

        assert_eq!(registry.inc_good_attempt("p", "a:1", 10), Some(1));
        assert_eq!(registry.inc_good_attempt("p", "a:1", 20), Some(2));
        assert_eq!(registry.inc_failure("p", "a:1", 30), Some(1));

        let record = registry.get("p", "a:1").unwrap();
        assert_eq!(record.number_of_successful_uses, 2);
        assert_eq!(record.last_successfully_used, 20);
        assert_eq!(record.number_of_failures, 1);
        assert_eq!(record.last_failure_used, 30);
        assert_eq!(registry.failure_count("p", "a:1"), Some(1));
    }

    #[test]
    fn clear_all_keeps_failures_and_telemetry() {
        let registry = registry();
        registry.insert_new("p", ["a:1"]);
        registry.inc_good_attempt("p", "a:1", 10);
        registry.inc_failure("p", "a:1", 11);
        registry.reset_start_time("p", "a:1", 12);
        registry.set_next_check("p", "a:1", 13);

        assert!(registry.clear_all("p", "a:1"));
        let record = registry.get("p", "a:1").unwrap();
        assert_eq!(record.good_attempts, 0);
        assert_eq!(record.start_get_proxy_time, 0);
        assert_eq!(record.next_check, 0);
        assert_eq!(record.failed_attempts, 1);
        assert_eq!(record.number_of_successful_uses, 1);
    }

    #[test]
    fn stamp_start_time_only_when_unset() {
        let registry = registry();
        registry.insert_new("p", ["a:1"]);
        assert_eq!(registry.stamp_start_time("p", "a:1", 50), Some(50));
        assert_eq!(registry.stamp_start_time("p", "a:1", 90), Some(50));
    }

    #[test]
    fn clear_usage_telemetry_spans_pools() {
        let registry = registry();
        registry.insert_new("p", ["a:1"]);
        registry.insert_new("q", ["a:1"]);
        registry.inc_good_attempt("p", "a:1", 10);
        registry.inc_failure("q", "a:1", 10);
        registry.set_next_check("q", "a:1", 99);

        registry.clear_usage_telemetry();

        for pool in ["p", "q"] {
            let record = registry.get(pool, "a:1").unwrap();
            assert_eq!(record.number_of_successful_uses, 0);
            assert_eq!(record.number_of_failures, 0);
            assert_eq!(record.last_successfully_used, 0);
            assert_eq!(record.last_failure_used, 0);
        }
        let record = registry.get("q", "a:1").unwrap();
        assert_eq!(record.failed_attempts, 1);
        assert_eq!(record.next_check, 99);
        assert_eq!(registry.get("p", "a:1").unwrap().good_attempts, 1);
    }

    #[test]
    fn remove_many_reports_existing_only() {
        let registry = registry();
        registry.insert_new("p", ["a:1", "b:2"]);
        let removed = registry.remove_many("p", &["a:1".to_string(), "z:9".to_string()]);
        assert_eq!(removed, vec!["a:1".to_string()]);
        assert!(!registry.exists("p", "a:1"));
        assert!(registry.exists("p", "b:2"));
    }
}
