//! Proxy records and lifecycle statuses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a proxy inside one pool.
///
/// A proxy is a member of exactly one status at a time. `Unchecked` and
/// `Good` proxies are also members of the derived *available* set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    /// Freshly ingested or revived, never handed out since.
    Unchecked,
    /// Worked recently and may be handed out again.
    Good,
    /// Handed out to a client and not yet returned.
    Busy,
    /// Used too many times in a row, resting.
    Postponed,
    /// Reported as failing, waiting for its backoff to elapse.
    Dead,
}

impl ProxyStatus {
    /// All primary statuses.
    pub const ALL: [ProxyStatus; 5] = [
        ProxyStatus::Unchecked,
        ProxyStatus::Good,
        ProxyStatus::Busy,
        ProxyStatus::Postponed,
        ProxyStatus::Dead,
    ];

    /// Whether a proxy in this status may be selected.
    pub fn is_available(self) -> bool {
        matches!(self, ProxyStatus::Unchecked | ProxyStatus::Good)
    }

    pub(crate) fn slot(self) -> usize {
        match self {
            ProxyStatus::Unchecked => 0,
            ProxyStatus::Good => 1,
            ProxyStatus::Busy => 2,
            ProxyStatus::Postponed => 3,
            ProxyStatus::Dead => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProxyStatus::Unchecked => "unchecked",
            ProxyStatus::Good => "good",
            ProxyStatus::Busy => "busy",
            ProxyStatus::Postponed => "postponed",
            ProxyStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProxyStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown proxy status `{}`", s))
    }
}

/// Population segment by provider origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    /// Every proxy.
    All,
    /// Only proxies from the rotating-proxy provider.
    Rack,
    /// Everything else.
    Free,
}

impl Segment {
    pub const ALL: [Segment; 3] = [Segment::All, Segment::Rack, Segment::Free];

    pub fn as_str(self) -> &'static str {
        match self {
            Segment::All => "all",
            Segment::Rack => "rack",
            Segment::Free => "free",
        }
    }
}

/// Health record of one proxy within one pool.
///
/// Times are unix seconds; zero means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyRecord {
    /// Start of the current busy or dead cycle.
    pub start_get_proxy_time: i64,
    /// Earliest time a reconciliation sweep may advance the proxy.
    pub next_check: i64,
    /// Successful uses since the last reset.
    pub good_attempts: i32,
    /// Failures, cumulative across dead cycles.
    pub failed_attempts: i32,
    pub last_successfully_used: i64,
    pub number_of_successful_uses: i32,
    pub last_failure_used: i64,
    pub number_of_failures: i32,
}

/// A proxy record as handed to the persistence collaborator, together with
/// its status at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProxy {
    pub pool: String,
    pub proxy: String,
    #[serde(default = "default_status")]
    pub status: ProxyStatus,
    #[serde(flatten)]
    pub record: ProxyRecord,
}

fn default_status() -> ProxyStatus {
    ProxyStatus::Unchecked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unchecked_and_good_are_available() {
        let available: Vec<_> = ProxyStatus::ALL
            .into_iter()
            .filter(|s| s.is_available())
            .collect();
        assert_eq!(available, vec![ProxyStatus::Unchecked, ProxyStatus::Good]);
    }

    #[test]
    fn status_parses_from_its_name() {
        for status in ProxyStatus::ALL {
            assert_eq!(status.as_str().parse::<ProxyStatus>(), Ok(status));
        }
        assert!("available".parse::<ProxyStatus>().is_err());
    }

    #[test]
    fn stored_proxy_without_status_loads_as_unchecked() {
        let json = r#"{"pool":"p","proxy":"1.1.1.1:80","start_get_proxy_time":0,
            "next_check":0,"good_attempts":2,"failed_attempts":1,
            "last_successfully_used":0,"number_of_successful_uses":0,
            "last_failure_used":0,"number_of_failures":0}"#;
        let stored: StoredProxy = serde_json::from_str(json).unwrap();
        assert_eq!(stored.status, ProxyStatus::Unchecked);
        assert_eq!(stored.record.good_attempts, 2);
    }
}
