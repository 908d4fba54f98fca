//! # proxy-pool-server
//!
//! A pool of proxy endpoints shared by scraping clients.
//!
//! Clients ask for a proxy, report whether it worked, and the pool keeps
//! each proxy's health: busy proxies come back after a short jittered
//! window, heavily used ones are postponed, failing ones back off
//! exponentially and are eventually dropped. State lives in memory and is
//! saved periodically through a [`store::ProxyStore`].

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod index;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod stats;
pub mod store;
pub mod telemetry;
pub mod utils;

pub use backoff::JitterMode;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PoolSettings, PoolSettingsBuilder, ServerConfig};
pub use error::{ConfigError, NoProxyAvailable, PoolError, StoreError};
pub use pool::{ProxyPool, ReconcileReport};
pub use proxy::{ProxyRecord, ProxyStatus, Segment, StoredProxy};
pub use store::{JsonFileStore, MemoryStore, ProxyStore, SaveReport};
