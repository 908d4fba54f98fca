//! Error types for the proxy-pool-server crate.
//!
//! A proxy that is missing from a pool is not an error here: registry and
//! index lookups answer with `Option`/`bool` and the manager logs and skips.

use thiserror::Error;

/// Error returned when no unchecked or good proxy is available in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("No proxy available in pool")]
pub struct NoProxyAvailable;

/// Failure of the persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage document error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Startup configuration that cannot be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

/// Errors surfaced by the asynchronous entry points of the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("proxy list fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("cannot read proxy list {path}: {source}")]
    SourceFile {
        path: String,
        source: std::io::Error,
    },
}
