//! Core proxy pool manager.
//!
//! ```text
//! unchecked --select--> busy --success--> good --select--> busy
//! good --success (max attempts)--> postponed
//! busy/postponed --next check elapsed--> good
//! any --failure--> dead --next check elapsed--> unchecked
//! dead --start time older than remove-dead window--> removed
//! ```
//!
//! [`ProxyPool`] coordinates the [`Registry`] and the [`StatusIndex`]. Each
//! call into either takes its own lock, so a compound operation may
//! interleave with another one on the same proxy. Adding and removing
//! proxies is serialised by the manager and touches both structures before
//! the next membership change starts. Status transitions only move proxies
//! the index already holds, and the ones that must not repeat (entering
//! `dead` or `good`) are checked and applied under the index lock.

use crate::backoff::{exp_backoff_full_jitter, random_uniform};
use crate::clock::{Clock, SystemClock};
use crate::config::PoolSettings;
use crate::error::{NoProxyAvailable, StoreError};
use crate::index::StatusIndex;
use crate::proxy::{ProxyStatus, StoredProxy};
use crate::registry::Registry;
use crate::stats::{self, PoolStats, PoolTimings, PopulationCounts, TimingSummary, UsefulnessOrder};
use crate::store::{ProxyStore, SaveReport};

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// Share of available proxies (in percent of busy + postponed) under which
/// a conditional reconcile runs.
const RECONCILE_AVAILABLE_PERCENT: f64 = 5.0;
/// Reconcile when every busy or postponed proxy is this far past its check.
const RECONCILE_OVERDUE_SECS: i64 = 5 * 60;

/// Proxies affected by each sweep of [`ProxyPool::reconcile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Dead proxies returned to unchecked.
    pub revived: usize,
    /// Busy or postponed proxies returned to good.
    pub returned: usize,
    /// Long-dead proxies deleted.
    pub purged: usize,
}

/// A set of proxy pools with health tracking and backoff.
pub struct ProxyPool {
    registry: Registry,
    index: StatusIndex,
    stats: PoolStats,
    settings: PoolSettings,
    store: Arc<dyn ProxyStore>,
    clock: Arc<dyn Clock>,
    /// Held while a proxy is added to or removed from both structures.
    membership: Mutex<()>,
    /// Removals not yet propagated to the store.
    removals: Mutex<Vec<(String, Vec<String>)>>,
    /// Serialises writes to the store so a snapshot taken before a removal
    /// is never written after it.
    persisting: tokio::sync::Mutex<()>,
}

impl ProxyPool {
    /// Create a pool manager on the system clock.
    pub fn new(settings: PoolSettings, store: Arc<dyn ProxyStore>) -> Self {
        Self::with_clock(settings, store, Arc::new(SystemClock))
    }

    /// Create a pool manager reading time from `clock`.
    pub fn with_clock(settings: PoolSettings, store: Arc<dyn ProxyStore>, clock: Arc<dyn Clock>) -> Self {
        let registry = Registry::new(settings.pools.iter().cloned());
        let index = StatusIndex::new(settings.pools.iter().cloned());
        Self::from_parts(settings, registry, index, store, clock)
    }

    /// Assemble a pool manager from existing parts.
    pub fn from_parts(
        settings: PoolSettings,
        registry: Registry,
        index: StatusIndex,
        store: Arc<dyn ProxyStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            index,
            stats: PoolStats::new(settings.pools.iter().cloned()),
            settings,
            store,
            clock,
            membership: Mutex::new(()),
            removals: Mutex::new(Vec::new()),
            persisting: tokio::sync::Mutex::new(()),
        }
    }

    /// Names of the configured pools.
    pub fn pools(&self) -> &[String] {
        &self.settings.pools
    }

    /// Policy, including the runtime tunables.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Per-proxy records.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Status sets of every pool.
    pub fn index(&self) -> &StatusIndex {
        &self.index
    }

    /// Current time in unix seconds.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    fn targets(&self, pool: Option<&str>) -> Vec<String> {
        match pool {
            Some(pool) => vec![pool.to_string()],
            None => self.settings.pools.clone(),
        }
    }

    /// Hand out a random unchecked or good proxy and mark it busy.
    pub fn select(&self, pool: &str) -> Result<String, NoProxyAvailable> {
        let now = self.clock.now();
        loop {
            let proxy = match self.index.take_random(pool, ProxyStatus::Busy) {
                Ok(proxy) => proxy,
                Err(e) => {
                    self.stats.record_unavailable(pool, now);
                    info!("[{}] there is no good/unchecked proxy available", pool);
                    return Err(e);
                }
            };
            if !self.registry.exists(pool, &proxy) {
                self.index.forget(pool, &proxy);
                continue;
            }
            self.stats.record_select(pool, now);
            self.backoff_to_good(pool, &proxy, true);
            debug!("[{}] proxy <{}> handed out", pool, proxy);
            return Ok(proxy);
        }
    }

    /// Schedule when a busy proxy may return to good.
    ///
    /// The check time is a jittered window after the proxy's cycle start
    /// while the pool has live proxies, and never earlier than one second
    /// from now. Unless `initial`, the cycle start moves to now.
    pub fn backoff_to_good(&self, pool: &str, proxy: &str, initial: bool) {
        let now = self.clock.now();
        let Some(start) = self.registry.start_time(pool, proxy) else {
            debug!("[{}] proxy <{}> was not found in proxy list", pool, proxy);
            return;
        };

        let mut postpone_time = now;
        if self.index.except_dead_len(pool) > 0 {
            postpone_time = start + random_uniform(self.settings.busy_postpone_secs, self.settings.jitter);
        }
        postpone_time = postpone_time.max(now + 1);

        let reference = if start > 0 { start } else { now };
        self.stats.record_postpone(pool, postpone_time - reference);
        self.registry.set_next_check(pool, proxy, postpone_time);
        if !initial {
            self.registry.reset_start_time(pool, proxy, now);
        }
    }

    /// Record a successful use of a proxy.
    pub fn report_success(&self, pool: &str, proxy: &str) {
        let now = self.clock.now();
        let Some(attempts) = self.registry.inc_good_attempt(pool, proxy, now) else {
            debug!("[{}] proxy <{}> was not found in proxy list", pool, proxy);
            return;
        };
        if let Some(start) = self.registry.start_time(pool, proxy).filter(|start| *start > 0) {
            self.stats.record_success_usage(pool, now - start);
        }

        if attempts >= self.settings.max_good_attempts() {
            debug!("[{}] {} good attempts, proxy <{}> moved to postponed", pool, attempts, proxy);
            self.mark_postponed(pool, proxy, now);
        } else {
            debug!("[{}] {} good attempts <{}>", pool, attempts, proxy);
            self.mark_good(pool, proxy);
        }
    }

    fn mark_postponed(&self, pool: &str, proxy: &str, now: i64) {
        let next_check = now + self.settings.good_attempts_backoff_secs;
        self.registry.set_next_check(pool, proxy, next_check);
        self.index.enter(pool, proxy, ProxyStatus::Postponed);
    }

    fn mark_good(&self, pool: &str, proxy: &str) {
        if !self.index.enter(pool, proxy, ProxyStatus::Good) {
            debug!("[{}] proxy <{}> is already good", pool, proxy);
            return;
        }
        self.backoff_to_good(pool, proxy, false);
        debug!("[{}] proxy <{}> set to good", pool, proxy);
    }

    /// Record a failed use of a proxy and send it to dead with a backoff.
    pub fn report_failure(&self, pool: &str, proxy: &str) {
        let now = self.clock.now();
        let Some(failures) = self.registry.inc_failure(pool, proxy, now) else {
            debug!("[{}] proxy <{}> was not found in proxy list", pool, proxy);
            return;
        };

        if !self.index.enter(pool, proxy, ProxyStatus::Dead) {
            debug!("[{}] proxy <{}> already dead", pool, proxy);
            return;
        }

        let backoff = if self.index.is_rack(pool, proxy) {
            self.settings.rack_backoff_secs
        } else {
            exp_backoff_full_jitter(failures, self.settings.jitter)
        };
        self.registry.set_next_check(pool, proxy, now + backoff);
        self.registry.stamp_start_time(pool, proxy, now);
        debug!("[{}] proxy <{}> is dead for {}s", pool, proxy, backoff);
    }

    /// Reset a proxy's record and return it to unchecked.
    pub fn clear_and_unset(&self, pool: &str, proxy: &str) -> bool {
        self.registry.clear_all(pool, proxy)
            && (self.index.enter(pool, proxy, ProxyStatus::Unchecked)
                || self.index.is(pool, proxy, ProxyStatus::Unchecked))
    }

    /// Advance every proxy whose scheduled time has elapsed and purge the
    /// long-dead ones.
    pub fn reconcile(&self, pool: &str) -> ReconcileReport {
        ReconcileReport {
            revived: self.revive_elapsed_dead(pool),
            returned: self.return_to_good(pool),
            purged: self.purge_dead(pool),
        }
    }

    fn revive_elapsed_dead(&self, pool: &str) -> usize {
        let now = self.clock.now();
        let mut revived = 0;
        for proxy in self.index.range_by_status(pool, ProxyStatus::Dead) {
            let due = self
                .registry
                .next_check(pool, &proxy)
                .is_some_and(|next_check| next_check > 0 && next_check <= now);
            if due && self.clear_and_unset(pool, &proxy) {
                revived += 1;
            }
        }
        if revived > 0 {
            info!("[{}] {} proxies moved from dead to unchecked", pool, revived);
        }
        revived
    }

    fn return_to_good(&self, pool: &str) -> usize {
        const WAITING: [ProxyStatus; 2] = [ProxyStatus::Busy, ProxyStatus::Postponed];
        let now = self.clock.now();
        let mut returned = 0;
        for proxy in self.index.range_union(pool, &WAITING) {
            let due = self
                .registry
                .next_check(pool, &proxy)
                .is_some_and(|next_check| next_check > 0 && next_check <= now);
            if !due {
                continue;
            }
            if self.index.is(pool, &proxy, ProxyStatus::Postponed) {
                self.registry.clear_good_attempts(pool, &proxy);
            }
            self.registry.clear_next_check(pool, &proxy);
            if self.index.transfer(pool, &proxy, &WAITING, ProxyStatus::Good) {
                returned += 1;
            }
        }
        if returned > 0 {
            info!("[{}] {} proxies moved from busy and postponed to good", pool, returned);
        }
        returned
    }

    /// Delete dead proxies whose cycle started more than the remove-dead
    /// window ago.
    pub fn purge_dead(&self, pool: &str) -> usize {
        let now = self.clock.now();
        let window = self.settings.remove_dead_secs();
        let expired: Vec<String> = self
            .index
            .range_by_status(pool, ProxyStatus::Dead)
            .into_iter()
            .filter(|proxy| {
                self.registry
                    .start_time(pool, proxy)
                    .is_some_and(|start| start != 0 && start.saturating_add(window) <= now)
            })
            .collect();
        if expired.is_empty() {
            return 0;
        }
        let purged = self.remove_in_pool(pool, &expired);
        info!("[{}] {} proxies removed because they've been dead too long", pool, purged);
        purged
    }

    /// Return every dead proxy to unchecked with fresh counters.
    pub fn revive_dead(&self, pool: &str) -> usize {
        debug!("[{}] move all proxies from dead to unchecked", pool);
        let mut revived = 0;
        for proxy in self.index.range_by_status(pool, ProxyStatus::Dead) {
            self.registry.clear_failed_attempts(pool, &proxy);
            if self.clear_and_unset(pool, &proxy) {
                revived += 1;
            }
        }
        revived
    }

    /// Reconcile only when the pool is starving or its waiting proxies are
    /// well overdue.
    pub fn reconcile_if_needed(&self, pool: &str) -> Option<ReconcileReport> {
        let waiting = self.index.len(pool, ProxyStatus::Busy) + self.index.len(pool, ProxyStatus::Postponed);
        if waiting == 0 {
            return None;
        }
        let available_percent = self.index.available_len(pool) as f64 / waiting as f64 * 100.0;
        let overdue = self.busy_wait_summary(pool).max < -RECONCILE_OVERDUE_SECS;
        info!(
            "[{}] percent of available proxies from busy and postponed {:.2}%",
            pool, available_percent
        );

        if available_percent < RECONCILE_AVAILABLE_PERCENT || overdue {
            Some(self.reconcile(pool))
        } else {
            None
        }
    }

    /// Seconds until each busy or postponed proxy is due, summarised.
    /// Negative values are overdue.
    pub fn busy_wait_summary(&self, pool: &str) -> TimingSummary {
        let now = self.clock.now();
        let waits: Vec<i64> = self
            .index
            .range_union(pool, &[ProxyStatus::Busy, ProxyStatus::Postponed])
            .iter()
            .filter_map(|proxy| self.registry.next_check(pool, proxy))
            .map(|next_check| next_check - now)
            .collect();
        TimingSummary::from_samples(&waits)
    }

    /// Add addresses to a pool, or to every pool when `pool` is `None`.
    /// Returns how many records were created.
    pub fn ingest(&self, pool: Option<&str>, addresses: &[String]) -> usize {
        let accepted: Vec<&str> = addresses
            .iter()
            .map(|address| address.trim())
            .filter(|address| !address.is_empty() && !address.starts_with('#'))
            .filter(|address| self.settings.use_rack || !self.settings.is_rack(address))
            .collect();
        debug!("loaded {} records", accepted.len());

        let mut total = 0;
        let _membership = self.membership.lock();
        for pool in self.targets(pool) {
            if !self.registry.has_pool(&pool) {
                warn!("[{}] is not a configured pool, ignoring {} proxies", pool, accepted.len());
                continue;
            }
            let added = self.registry.insert_new(&pool, accepted.iter().copied());
            for proxy in &added {
                if self.settings.is_rack(proxy) {
                    self.index.mark_rack(&pool, proxy);
                }
                self.index.move_to(&pool, proxy, ProxyStatus::Unchecked);
            }
            debug!("to [{}] added new {} records", pool, added.len());
            total += added.len();
        }
        total
    }

    /// Remove addresses from a pool, or from every pool when `pool` is
    /// `None`. Returns how many records were deleted.
    pub fn remove_many(&self, pool: Option<&str>, addresses: &[String]) -> usize {
        self.targets(pool)
            .iter()
            .map(|pool| self.remove_in_pool(pool, addresses))
            .sum()
    }

    fn remove_in_pool(&self, pool: &str, addresses: &[String]) -> usize {
        let removed = {
            let _membership = self.membership.lock();
            let removed = self.registry.remove_many(pool, addresses);
            for proxy in &removed {
                self.index.forget(pool, proxy);
            }
            removed
        };
        let count = removed.len();
        if count > 0 {
            self.removals.lock().push((pool.to_string(), removed));
        }
        count
    }

    /// Proxies of a status, sorted.
    pub fn list_by_status(&self, pool: &str, status: ProxyStatus) -> Vec<String> {
        let mut proxies = self.index.range_by_status(pool, status);
        proxies.sort();
        proxies
    }

    /// Every proxy that is not dead, sorted.
    pub fn list_working(&self, pool: &str) -> Vec<String> {
        let mut proxies = self
            .index
            .range_union(pool, &[ProxyStatus::Busy, ProxyStatus::Postponed]);
        proxies.extend(self.index.range_available(pool));
        proxies.sort();
        proxies
    }

    /// Status counts of a pool, split by rack and free proxies.
    pub fn population_counts(&self, pool: &str) -> PopulationCounts {
        PopulationCounts::collect(&self.index, pool)
    }

    /// Timing summaries recorded for a pool.
    pub fn timings(&self, pool: &str) -> PoolTimings {
        self.stats.timings(pool)
    }

    /// Write every pool's population and request rate to the log. The rate
    /// window restarts afterwards.
    pub fn log_stats(&self) {
        let now = self.clock.now();
        for pool in self.pools() {
            stats::log_population(pool, &self.population_counts(pool));
            let rate = self.stats.request_rate(pool);
            if rate.count > 0 {
                info!("[{}] {:.2} proxies handed out per second", pool, rate.per_second(now));
            }
            self.stats.reset_request_rate(pool);
        }
    }

    /// HTML tables of every pool's population.
    pub fn html_stats(&self) -> String {
        let pools: Vec<(String, PopulationCounts)> = self
            .pools()
            .iter()
            .map(|pool| (pool.clone(), self.population_counts(pool)))
            .collect();
        stats::render_html(&pools)
    }

    /// CSV usefulness report of a pool.
    pub fn usefulness_csv(&self, pool: &str, order: UsefulnessOrder) -> String {
        stats::usefulness_csv(self.registry.snapshot(pool), order)
    }

    /// Zero success and failure telemetry in every pool.
    pub fn clear_usage_telemetry(&self) {
        self.registry.clear_usage_telemetry();
        info!("usage telemetry cleared");
    }

    /// Change how many successes in a row postpone a proxy. Values below one
    /// are rejected and leave the setting unchanged.
    pub fn set_max_good_attempts(&self, attempts: i32) -> bool {
        if attempts <= 0 {
            warn!("max attempts value {} rejected, it must be positive", attempts);
            return false;
        }
        info!("new max attempts value set to {}", attempts);
        self.settings.set_max_good_attempts(attempts);
        true
    }

    /// Change how many days a proxy may stay dead. Values below one are
    /// rejected and leave the setting unchanged.
    pub fn set_remove_dead_days(&self, days: i64) -> bool {
        if days <= 0 {
            warn!("clearance time of {} days rejected, it must be positive", days);
            return false;
        }
        info!("new clearance time set to {} days", days);
        self.settings.set_remove_dead_days(days);
        true
    }

    /// Every record of a pool with its current status.
    pub fn snapshot(&self, pool: &str) -> Vec<StoredProxy> {
        self.registry
            .snapshot(pool)
            .into_iter()
            .map(|(proxy, record)| StoredProxy {
                pool: pool.to_string(),
                status: self
                    .index
                    .status_of(pool, &proxy)
                    .unwrap_or(ProxyStatus::Unchecked),
                proxy,
                record,
            })
            .collect()
    }

    /// Fill the pools from the store. A pool that fails to load starts
    /// empty.
    pub async fn load(&self) -> usize {
        let mut loaded = 0;
        for pool in self.pools() {
            match self.store.load_all(pool).await {
                Ok(records) => loaded += self.restore(pool, records),
                Err(e) => warn!("[{}] cannot load stored proxies, starting empty: {}", pool, e),
            }
        }
        info!("loaded {} records from storage", loaded);
        loaded
    }

    fn restore(&self, pool: &str, records: Vec<StoredProxy>) -> usize {
        let _membership = self.membership.lock();
        let mut restored = 0;
        for stored in records {
            let rack = self.settings.is_rack(&stored.proxy);
            if rack && !self.settings.use_rack {
                continue;
            }
            if !self.registry.put(pool, &stored.proxy, stored.record) {
                continue;
            }
            if rack {
                self.index.mark_rack(pool, &stored.proxy);
            }
            self.index.move_to(pool, &stored.proxy, stored.status);
            restored += 1;
        }
        restored
    }

    /// Send queued removals to the store. Failures are logged and dropped.
    pub async fn persist_removals(&self) -> usize {
        let _persisting = self.persisting.lock().await;
        self.flush_removals().await
    }

    async fn flush_removals(&self) -> usize {
        let pending = std::mem::take(&mut *self.removals.lock());
        let mut removed = 0;
        for (pool, proxies) in pending {
            match self.store.remove_many(&pool, &proxies).await {
                Ok(count) => removed += count,
                Err(e) => warn!("[{}] error on removing {} records from storage: {}", pool, proxies.len(), e),
            }
        }
        removed
    }

    /// Upsert every pool into the store. A failing pool is skipped until the
    /// next call; the last error is returned.
    pub async fn save_all(&self) -> Result<SaveReport, StoreError> {
        let _persisting = self.persisting.lock().await;
        self.flush_removals().await;

        let mut total = SaveReport::default();
        let mut failure = None;
        for pool in self.pools() {
            match self.store.save_all(pool, self.snapshot(pool)).await {
                Ok(report) => {
                    total.inserted += report.inserted;
                    total.updated += report.updated;
                }
                Err(e) => {
                    warn!("[{}] error on saving records to storage: {}", pool, e);
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => {
                info!("storage: inserted {}, updated {}", total.inserted, total.updated);
                Ok(total)
            }
        }
    }
}
