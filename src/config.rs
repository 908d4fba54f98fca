//! Configuration for the proxy pool and the server around it.

use crate::backoff::JitterMode;
use crate::error::ConfigError;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use url::Url;

const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// Policy of the pool manager.
///
/// `max_good_attempts` and `remove_dead_secs` can be changed while the
/// server runs; everything else is fixed at startup.
#[derive(Debug)]
pub struct PoolSettings {
    /// Pools to track.
    pub pools: Vec<String>,
    /// Fixed rest period after a proxy reached `max_good_attempts`.
    pub good_attempts_backoff_secs: i64,
    /// Fixed backoff for failed rack proxies.
    pub rack_backoff_secs: i64,
    /// Base window before a busy proxy may return to good.
    pub busy_postpone_secs: f64,
    /// Host fragments identifying rack proxies.
    pub rack_hosts: Vec<String>,
    /// Whether rack proxies are accepted at all.
    pub use_rack: bool,
    /// Spread applied to backoff durations.
    pub jitter: JitterMode,
    max_good_attempts: AtomicI32,
    remove_dead_secs: AtomicI64,
}

impl PoolSettings {
    /// Create a new settings builder.
    pub fn builder() -> PoolSettingsBuilder {
        PoolSettingsBuilder::new()
    }

    pub fn max_good_attempts(&self) -> i32 {
        self.max_good_attempts.load(Ordering::Relaxed)
    }

    pub fn set_max_good_attempts(&self, attempts: i32) {
        self.max_good_attempts.store(attempts, Ordering::Relaxed);
    }

    /// How long a proxy may stay dead before it is purged.
    pub fn remove_dead_secs(&self) -> i64 {
        self.remove_dead_secs.load(Ordering::Relaxed)
    }

    pub fn set_remove_dead_secs(&self, secs: i64) {
        self.remove_dead_secs.store(secs, Ordering::Relaxed);
    }

    pub fn set_remove_dead_days(&self, days: i64) {
        self.set_remove_dead_secs(days.saturating_mul(SECS_PER_DAY));
    }

    /// Whether an address belongs to the rotating-proxy provider.
    pub fn is_rack(&self, proxy: &str) -> bool {
        self.rack_hosts
            .iter()
            .any(|host| !host.is_empty() && proxy.contains(host.as_str()))
    }
}

/// Builder for `PoolSettings`.
pub struct PoolSettingsBuilder {
    pools: Vec<String>,
    max_good_attempts: Option<i32>,
    good_attempts_backoff_secs: Option<i64>,
    rack_backoff_secs: Option<i64>,
    remove_dead_secs: Option<i64>,
    busy_postpone_secs: Option<f64>,
    rack_hosts: Vec<String>,
    use_rack: Option<bool>,
    jitter: Option<JitterMode>,
}

impl PoolSettingsBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            pools: Vec::new(),
            max_good_attempts: None,
            good_attempts_backoff_secs: None,
            rack_backoff_secs: None,
            remove_dead_secs: None,
            busy_postpone_secs: None,
            rack_hosts: Vec::new(),
            use_rack: None,
            jitter: None,
        }
    }

    /// Set the pools to track.
    pub fn pools(mut self, pools: Vec<impl Into<String>>) -> Self {
        self.pools = pools.into_iter().map(Into::into).collect();
        self
    }

    /// Set how many successes in a row postpone a proxy.
    pub fn max_good_attempts(mut self, attempts: i32) -> Self {
        self.max_good_attempts = Some(attempts);
        self
    }

    /// Set the rest period of a postponed proxy.
    pub fn good_attempts_backoff_secs(mut self, secs: i64) -> Self {
        self.good_attempts_backoff_secs = Some(secs);
        self
    }

    /// Set the backoff of a failed rack proxy.
    pub fn rack_backoff_secs(mut self, secs: i64) -> Self {
        self.rack_backoff_secs = Some(secs);
        self
    }

    /// Set how long a proxy may stay dead before it is purged.
    pub fn remove_dead_secs(mut self, secs: i64) -> Self {
        self.remove_dead_secs = Some(secs);
        self
    }

    /// Set the base window before a busy proxy returns to good.
    pub fn busy_postpone_secs(mut self, secs: f64) -> Self {
        self.busy_postpone_secs = Some(secs);
        self
    }

    /// Set the host fragments identifying rack proxies.
    pub fn rack_hosts(mut self, hosts: Vec<impl Into<String>>) -> Self {
        self.rack_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Accept or reject rack proxies.
    pub fn use_rack(mut self, use_rack: bool) -> Self {
        self.use_rack = Some(use_rack);
        self
    }

    /// Set the jitter spread.
    pub fn jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Build the settings.
    pub fn build(self) -> PoolSettings {
        let pools = if self.pools.is_empty() {
            vec!["default".to_string()]
        } else {
            self.pools
        };
        PoolSettings {
            pools,
            good_attempts_backoff_secs: self.good_attempts_backoff_secs.unwrap_or(600),
            rack_backoff_secs: self.rack_backoff_secs.unwrap_or(600),
            busy_postpone_secs: self.busy_postpone_secs.unwrap_or(10.0),
            rack_hosts: self.rack_hosts,
            use_rack: self.use_rack.unwrap_or(true),
            jitter: self.jitter.unwrap_or_default(),
            max_good_attempts: AtomicI32::new(self.max_good_attempts.unwrap_or(10)),
            remove_dead_secs: AtomicI64::new(self.remove_dead_secs.unwrap_or(7 * SECS_PER_DAY)),
        }
    }
}

impl Default for PoolSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Root of the YAML configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub listen: String,
    /// Pool names, one per scraping client.
    pub pools: Vec<String>,
    pub proxy_rack: ProxyRackConfig,
    /// Where fresh proxy lists come from.
    pub sources: Vec<SourceConfig>,
    pub schedule: ScheduleConfig,
    pub proxy: ProxyPolicyConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            pools: vec!["default".to_string()],
            proxy_rack: ProxyRackConfig::default(),
            sources: Vec::new(),
            schedule: ScheduleConfig::default(),
            proxy: ProxyPolicyConfig::default(),
            storage: StorageConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Rotating-proxy provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyRackConfig {
    pub enabled: bool,
    pub hosts: Vec<String>,
    pub backoff_secs: i64,
}

impl Default for ProxyRackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hosts: Vec::new(),
            backoff_secs: 600,
        }
    }
}

/// A proxy list source: an http(s) URL or a local file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Periods of the background jobs, in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub load_proxies_secs: u64,
    pub log_stats_secs: u64,
    pub reconcile_secs: u64,
    pub save_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            load_proxies_secs: 600,
            log_stats_secs: 60,
            reconcile_secs: 30,
            save_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyPolicyConfig {
    pub max_good_attempts: i32,
    pub good_attempts_backoff_secs: i64,
    pub remove_dead_days: i64,
    pub busy_postpone_secs: f64,
    pub jitter: JitterMode,
}

impl Default for ProxyPolicyConfig {
    fn default() -> Self {
        Self {
            max_good_attempts: 10,
            good_attempts_backoff_secs: 600,
            remove_dead_days: 7,
            busy_postpone_secs: 10.0,
            jitter: JitterMode::Symmetric,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one JSON document per pool.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data"),
        }
    }
}

/// Prometheus exporter of the request metrics.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:9090".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load and validate configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration and report every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.listen.parse::<SocketAddr>().is_err() {
            problems.push(format!("listen address `{}` is not host:port", self.listen));
        }

        if self.metrics.enabled && self.metrics.listen.parse::<SocketAddr>().is_err() {
            problems.push(format!("metrics.listen `{}` is not host:port", self.metrics.listen));
        }

        if self.pools.is_empty() {
            problems.push("at least one pool is required".to_string());
        }
        let mut names = HashSet::new();
        for pool in &self.pools {
            if pool.trim().is_empty() {
                problems.push("pool names must not be empty".to_string());
            } else if !names.insert(pool.as_str()) {
                problems.push(format!("pool `{}` is listed twice", pool));
            }
        }

        for source in &self.sources {
            if source.url.starts_with("http") {
                match Url::parse(&source.url) {
                    Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                    _ => problems.push(format!("source `{}` is not an http(s) URL", source.url)),
                }
            } else if source.url.trim().is_empty() {
                problems.push("source url must not be empty".to_string());
            }
        }

        let schedule = &self.schedule;
        for (name, secs) in [
            ("load_proxies_secs", schedule.load_proxies_secs),
            ("log_stats_secs", schedule.log_stats_secs),
            ("reconcile_secs", schedule.reconcile_secs),
            ("save_secs", schedule.save_secs),
        ] {
            if secs == 0 {
                problems.push(format!("schedule.{} must be positive", name));
            }
        }

        if self.proxy.max_good_attempts <= 0 {
            problems.push("proxy.max_good_attempts must be positive".to_string());
        }
        if self.proxy.remove_dead_days <= 0 {
            problems.push("proxy.remove_dead_days must be positive".to_string());
        }
        if self.proxy.good_attempts_backoff_secs < 0 || self.proxy_rack.backoff_secs < 0 {
            problems.push("backoff periods must not be negative".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Pool manager settings described by this configuration.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings::builder()
            .pools(self.pools.clone())
            .max_good_attempts(self.proxy.max_good_attempts)
            .good_attempts_backoff_secs(self.proxy.good_attempts_backoff_secs)
            .remove_dead_secs(self.proxy.remove_dead_days.saturating_mul(SECS_PER_DAY))
            .busy_postpone_secs(self.proxy.busy_postpone_secs)
            .rack_backoff_secs(self.proxy_rack.backoff_secs)
            .rack_hosts(self.proxy_rack.hosts.clone())
            .use_rack(self.proxy_rack.enabled)
            .jitter(self.proxy.jitter)
            .build()
    }
}
