//! Pool and status membership sets.
//!
//! Every proxy of a pool sits in exactly one of the five status sets.
//! `available` mirrors `unchecked ∪ good`; every status change goes through
//! one private transition that updates both in the same critical section.
//! The rack flag is orthogonal and survives transitions.

use crate::error::NoProxyAvailable;
use crate::proxy::{ProxyStatus, Segment};

use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct PoolSets {
    statuses: [HashSet<String>; 5],
    available: HashSet<String>,
    rack: HashSet<String>,
}

impl PoolSets {
    fn status_of(&self, proxy: &str) -> Option<ProxyStatus> {
        ProxyStatus::ALL
            .into_iter()
            .find(|status| self.statuses[status.slot()].contains(proxy))
    }

    fn move_to(&mut self, proxy: &str, status: ProxyStatus) {
        for set in self.statuses.iter_mut() {
            set.remove(proxy);
        }
        self.statuses[status.slot()].insert(proxy.to_string());
        if status.is_available() {
            self.available.insert(proxy.to_string());
        } else {
            self.available.remove(proxy);
        }
    }

    fn enter(&mut self, proxy: &str, status: ProxyStatus) -> bool {
        match self.status_of(proxy) {
            Some(current) if current != status => {
                self.move_to(proxy, status);
                true
            }
            _ => false,
        }
    }

    fn forget(&mut self, proxy: &str) -> bool {
        let mut found = false;
        for set in self.statuses.iter_mut() {
            found |= set.remove(proxy);
        }
        self.available.remove(proxy);
        self.rack.remove(proxy);
        found
    }

    fn random_available(&self) -> Option<&String> {
        if self.available.is_empty() {
            return None;
        }
        let position = rand::rng().random_range(0..self.available.len());
        self.available.iter().nth(position)
    }

    fn count<'a>(&self, members: impl Iterator<Item = &'a String>, segment: Segment) -> usize {
        match segment {
            Segment::All => members.count(),
            Segment::Rack => members.filter(|proxy| self.rack.contains(*proxy)).count(),
            Segment::Free => members.filter(|proxy| !self.rack.contains(*proxy)).count(),
        }
    }
}

/// Status membership of every proxy, per pool.
#[derive(Debug, Default)]
pub struct StatusIndex {
    pools: RwLock<HashMap<String, PoolSets>>,
}

impl StatusIndex {
    /// Create an index tracking the given pools.
    pub fn new<I, S>(pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pools = pools
            .into_iter()
            .map(|pool| (pool.into(), PoolSets::default()))
            .collect();
        Self {
            pools: RwLock::new(pools),
        }
    }

    /// Move a proxy into `status`, leaving every other status set. Returns
    /// `false` for an unknown pool.
    pub fn move_to(&self, pool: &str, proxy: &str, status: ProxyStatus) -> bool {
        let mut pools = self.pools.write();
        match pools.get_mut(pool) {
            Some(sets) => {
                sets.move_to(proxy, status);
                true
            }
            None => false,
        }
    }

    /// Move an indexed proxy into `status` unless it is already there.
    /// Returns whether it moved; an unknown pool or proxy counts as not
    /// moved.
    pub fn enter(&self, pool: &str, proxy: &str, status: ProxyStatus) -> bool {
        let mut pools = self.pools.write();
        pools
            .get_mut(pool)
            .is_some_and(|sets| sets.enter(proxy, status))
    }

    /// Move a proxy into `to` only while its status is one of `from`.
    pub fn transfer(&self, pool: &str, proxy: &str, from: &[ProxyStatus], to: ProxyStatus) -> bool {
        let mut pools = self.pools.write();
        let Some(sets) = pools.get_mut(pool) else {
            return false;
        };
        match sets.status_of(proxy) {
            Some(current) if from.contains(&current) => {
                sets.move_to(proxy, to);
                true
            }
            _ => false,
        }
    }

    /// Pick a uniformly random available proxy and move it to `status` in
    /// the same critical section.
    pub fn take_random(&self, pool: &str, status: ProxyStatus) -> Result<String, NoProxyAvailable> {
        let mut pools = self.pools.write();
        let sets = pools.get_mut(pool).ok_or(NoProxyAvailable)?;
        let proxy = sets.random_available().cloned().ok_or(NoProxyAvailable)?;
        sets.move_to(&proxy, status);
        Ok(proxy)
    }

    /// Pick a uniformly random available proxy without changing anything.
    pub fn random_pick(&self, pool: &str) -> Result<String, NoProxyAvailable> {
        let pools = self.pools.read();
        pools
            .get(pool)
            .and_then(PoolSets::random_available)
            .cloned()
            .ok_or(NoProxyAvailable)
    }

    /// Drop a proxy from every set, rack flag included. Returns whether it
    /// had a status.
    pub fn forget(&self, pool: &str, proxy: &str) -> bool {
        let mut pools = self.pools.write();
        pools.get_mut(pool).is_some_and(|sets| sets.forget(proxy))
    }

    pub fn status_of(&self, pool: &str, proxy: &str) -> Option<ProxyStatus> {
        self.pools.read().get(pool)?.status_of(proxy)
    }

    pub fn is(&self, pool: &str, proxy: &str, status: ProxyStatus) -> bool {
        self.pools
            .read()
            .get(pool)
            .is_some_and(|sets| sets.statuses[status.slot()].contains(proxy))
    }

    pub fn len(&self, pool: &str, status: ProxyStatus) -> usize {
        self.pools
            .read()
            .get(pool)
            .map_or(0, |sets| sets.statuses[status.slot()].len())
    }

    pub fn available_len(&self, pool: &str) -> usize {
        self.pools.read().get(pool).map_or(0, |sets| sets.available.len())
    }

    /// Proxies that are not dead.
    pub fn except_dead_len(&self, pool: &str) -> usize {
        let pools = self.pools.read();
        pools.get(pool).map_or(0, |sets| {
            sets.available.len()
                + sets.statuses[ProxyStatus::Busy.slot()].len()
                + sets.statuses[ProxyStatus::Postponed.slot()].len()
        })
    }

    pub fn range_by_status(&self, pool: &str, status: ProxyStatus) -> Vec<String> {
        self.range_union(pool, &[status])
    }

    pub fn range_union(&self, pool: &str, statuses: &[ProxyStatus]) -> Vec<String> {
        let pools = self.pools.read();
        let Some(sets) = pools.get(pool) else {
            return Vec::new();
        };
        statuses
            .iter()
            .flat_map(|status| sets.statuses[status.slot()].iter().cloned())
            .collect()
    }

    pub fn range_available(&self, pool: &str) -> Vec<String> {
        self.pools
            .read()
            .get(pool)
            .map(|sets| sets.available.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Flag a proxy as coming from the rotating-proxy provider.
    pub fn mark_rack(&self, pool: &str, proxy: &str) -> bool {
        let mut pools = self.pools.write();
        match pools.get_mut(pool) {
            Some(sets) => {
                sets.rack.insert(proxy.to_string());
                true
            }
            None => false,
        }
    }

    pub fn is_rack(&self, pool: &str, proxy: &str) -> bool {
        self.pools
            .read()
            .get(pool)
            .is_some_and(|sets| sets.rack.contains(proxy))
    }

    /// Count members of `status` (every status when `None`) in a segment.
    pub fn count_by_segment(&self, pool: &str, status: Option<ProxyStatus>, segment: Segment) -> usize {
        let pools = self.pools.read();
        let Some(sets) = pools.get(pool) else {
            return 0;
        };
        match status {
            Some(status) => sets.count(sets.statuses[status.slot()].iter(), segment),
            None => sets.count(sets.statuses.iter().flatten(), segment),
        }
    }

    pub fn count_available_by_segment(&self, pool: &str, segment: Segment) -> usize {
        let pools = self.pools.read();
        pools
            .get(pool)
            .map_or(0, |sets| sets.count(sets.available.iter(), segment))
    }

    /// Every proxy of a pool with its status.
    pub fn members(&self, pool: &str) -> Vec<(String, ProxyStatus)> {
        let pools = self.pools.read();
        let Some(sets) = pools.get(pool) else {
            return Vec::new();
        };
        ProxyStatus::ALL
            .into_iter()
            .flat_map(|status| {
                sets.statuses[status.slot()]
                    .iter()
                    .map(move |proxy| (proxy.clone(), status))
            })
            .collect()
    }

    /// Check that no proxy has two statuses and that `available` equals
    /// `unchecked ∪ good`.
    #[cfg(test)]
    pub(crate) fn check_consistency(&self, pool: &str) -> Result<(), String> {
        let pools = self.pools.read();
        let sets = pools.get(pool).ok_or_else(|| format!("no pool {}", pool))?;

        let mut seen = HashSet::new();
        for set in &sets.statuses {
            for proxy in set {
                if !seen.insert(proxy) {
                    return Err(format!("{} has more than one status", proxy));
                }
            }
        }

        let expected: HashSet<&String> = sets.statuses[ProxyStatus::Unchecked.slot()]
            .iter()
            .chain(sets.statuses[ProxyStatus::Good.slot()].iter())
            .collect();
        let actual: HashSet<&String> = sets.available.iter().collect();
        if expected != actual {
            return Err(format!("available {:?} != unchecked+good {:?}", actual, expected));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_to_keeps_one_status_and_available_in_step() {
        let index = StatusIndex::new(["p"]);
        let proxy = "1.1.1.1:80";

        for status in [
            ProxyStatus::Unchecked,
            ProxyStatus::Busy,
            ProxyStatus::Good,
            ProxyStatus::Postponed,
            ProxyStatus::Dead,
            ProxyStatus::Unchecked,
        ] {
            assert!(index.move_to("p", proxy, status));
            assert_eq!(index.status_of("p", proxy), Some(status));
            assert_eq!(index.available_len("p"), usize::from(status.is_available()));
            index.check_consistency("p").unwrap();
        }
    }

    #[test]
    fn enter_reports_real_moves_only() {
        let index = StatusIndex::new(["p"]);
        assert!(!index.enter("p", "a:1", ProxyStatus::Dead));
        assert_eq!(index.status_of("p", "a:1"), None);

        index.move_to("p", "a:1", ProxyStatus::Unchecked);
        assert!(index.enter("p", "a:1", ProxyStatus::Dead));
        assert!(!index.enter("p", "a:1", ProxyStatus::Dead));
        assert!(index.enter("p", "a:1", ProxyStatus::Good));
        assert!(!index.enter("q", "a:1", ProxyStatus::Good));
        index.check_consistency("p").unwrap();
    }

    #[test]
    fn transfer_requires_a_source_status() {
        let index = StatusIndex::new(["p"]);
        index.move_to("p", "a:1", ProxyStatus::Dead);
        let waiting = [ProxyStatus::Busy, ProxyStatus::Postponed];
        assert!(!index.transfer("p", "a:1", &waiting, ProxyStatus::Good));
        assert_eq!(index.status_of("p", "a:1"), Some(ProxyStatus::Dead));

        index.move_to("p", "a:1", ProxyStatus::Postponed);
        assert!(index.transfer("p", "a:1", &waiting, ProxyStatus::Good));
        assert!(index.is("p", "a:1", ProxyStatus::Good));
        assert!(!index.transfer("p", "b:1", &waiting, ProxyStatus::Good));
        index.check_consistency("p").unwrap();
    }

    #[test]
    fn unknown_pool_is_rejected() {
        let index = StatusIndex::new(["p"]);
        assert!(!index.move_to("q", "a:1", ProxyStatus::Good));
        assert_eq!(index.random_pick("q"), Err(NoProxyAvailable));
        assert_eq!(index.len("q", ProxyStatus::Good), 0);
    }

    #[test]
    fn random_pick_only_returns_available() {
        let index = StatusIndex::new(["p"]);
        assert_eq!(index.random_pick("p"), Err(NoProxyAvailable));

        index.move_to("p", "busy:1", ProxyStatus::Busy);
        index.move_to("p", "dead:1", ProxyStatus::Dead);
        index.move_to("p", "post:1", ProxyStatus::Postponed);
        assert_eq!(index.random_pick("p"), Err(NoProxyAvailable));

        index.move_to("p", "good:1", ProxyStatus::Good);
        for _ in 0..20 {
            assert_eq!(index.random_pick("p").unwrap(), "good:1");
        }
    }

    #[test]
    fn random_pick_reaches_every_available_proxy() {
        let index = StatusIndex::new(["p"]);
        index.move_to("p", "a:1", ProxyStatus::Good);
        index.move_to("p", "b:1", ProxyStatus::Unchecked);
        index.move_to("p", "c:1", ProxyStatus::Good);

        let mut seen = HashSet::new();
        for _ in 0..500 {
            seen.insert(index.random_pick("p").unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn take_random_moves_the_pick() {
        let index = StatusIndex::new(["p"]);
        index.move_to("p", "a:1", ProxyStatus::Unchecked);

        let picked = index.take_random("p", ProxyStatus::Busy).unwrap();
        assert_eq!(picked, "a:1");
        assert!(index.is("p", "a:1", ProxyStatus::Busy));
        assert_eq!(index.take_random("p", ProxyStatus::Busy), Err(NoProxyAvailable));
        index.check_consistency("p").unwrap();
    }

    #[test]
    fn rack_flag_survives_transitions_and_segments_counts() {
        let index = StatusIndex::new(["p"]);
        index.move_to("p", "rack.example:1", ProxyStatus::Unchecked);
        index.mark_rack("p", "rack.example:1");
        index.move_to("p", "free:1", ProxyStatus::Unchecked);
        index.move_to("p", "free:2", ProxyStatus::Dead);

        index.move_to("p", "rack.example:1", ProxyStatus::Dead);
        assert!(index.is_rack("p", "rack.example:1"));

        let dead = Some(ProxyStatus::Dead);
        assert_eq!(index.count_by_segment("p", dead, Segment::All), 2);
        assert_eq!(index.count_by_segment("p", dead, Segment::Rack), 1);
        assert_eq!(index.count_by_segment("p", dead, Segment::Free), 1);
        assert_eq!(index.count_by_segment("p", None, Segment::All), 3);
        assert_eq!(index.count_by_segment("p", None, Segment::Rack), 1);
        assert_eq!(index.count_available_by_segment("p", Segment::Free), 1);
        assert_eq!(index.count_available_by_segment("p", Segment::Rack), 0);
    }

    #[test]
    fn forget_clears_every_membership() {
        let index = StatusIndex::new(["p"]);
        index.move_to("p", "a:1", ProxyStatus::Good);
        index.mark_rack("p", "a:1");

        assert!(index.forget("p", "a:1"));
        assert_eq!(index.status_of("p", "a:1"), None);
        assert!(!index.is_rack("p", "a:1"));
        assert_eq!(index.available_len("p"), 0);
        assert!(!index.forget("p", "a:1"));
    }

    #[test]
    fn range_union_and_except_dead() {
        let index = StatusIndex::new(["p"]);
        index.move_to("p", "a:1", ProxyStatus::Busy);
        index.move_to("p", "b:1", ProxyStatus::Postponed);
        index.move_to("p", "c:1", ProxyStatus::Dead);
        index.move_to("p", "d:1", ProxyStatus::Good);

        let mut union = index.range_union("p", &[ProxyStatus::Busy, ProxyStatus::Postponed]);
        union.sort();
        assert_eq!(union, vec!["a:1".to_string(), "b:1".to_string()]);
        assert_eq!(index.except_dead_len("p"), 3);
        assert_eq!(index.members("p").len(), 4);
    }
}
