//! Periodic background jobs of the server.

use crate::config::{ScheduleConfig, SourceConfig};
use crate::pool::ProxyPool;
use crate::utils::fetch_proxies_from_source;

use futures::future;
use log::{info, warn};
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Fetch every source concurrently and ingest the union into all pools.
/// Returns how many records were created.
pub async fn reload_proxies(pool: &ProxyPool, client: &Client, sources: &[SourceConfig]) -> usize {
    info!("reloading proxies from {} sources", sources.len());
    let results = future::join_all(
        sources
            .iter()
            .map(|source| fetch_proxies_from_source(client, source)),
    )
    .await;

    let mut proxies = Vec::new();
    for (source, result) in sources.iter().zip(results) {
        match result {
            Ok(list) => proxies.extend(list),
            Err(e) => warn!("error loading proxies from {}: {}", source.url, e),
        }
    }
    pool.ingest(None, &proxies)
}

/// Reconcile every pool that needs it.
pub fn reconcile_pools(pool: &ProxyPool) {
    for name in pool.pools() {
        pool.reconcile_if_needed(name);
    }
}

/// Handles of the running background jobs. Dropping it stops them.
pub struct Scheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start every job on the current tokio runtime.
    pub fn start(pool: Arc<ProxyPool>, sources: Vec<SourceConfig>, schedule: &ScheduleConfig) -> Self {
        let client = Client::new();
        let sources = Arc::new(sources);

        let tasks = vec![
            every(schedule.load_proxies_secs, {
                let pool = pool.clone();
                move || {
                    let pool = pool.clone();
                    let client = client.clone();
                    let sources = sources.clone();
                    async move {
                        reload_proxies(&pool, &client, &sources).await;
                    }
                }
            }),
            every(schedule.log_stats_secs, {
                let pool = pool.clone();
                move || {
                    let pool = pool.clone();
                    async move { pool.log_stats() }
                }
            }),
            every(schedule.reconcile_secs, {
                let pool = pool.clone();
                move || {
                    let pool = pool.clone();
                    async move { reconcile_pools(&pool) }
                }
            }),
            every(schedule.save_secs, move || {
                let pool = pool.clone();
                async move {
                    // failures are already logged per pool
                    let _ = pool.save_all().await;
                }
            }),
        ];

        Self { tasks }
    }

    /// Number of running jobs.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Run `job` every `secs` seconds, starting one period from now.
fn every<F, Fut>(secs: u64, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            job().await;
        }
    })
}
