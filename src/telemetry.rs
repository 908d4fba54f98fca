//! Request telemetry of the HTTP surface.
//!
//! Every request is counted by status and timed. The totals are kept in
//! memory for `/stats` and also emitted through the `metrics` facade, so a
//! Prometheus exporter picks them up when one is installed.

use crate::stats::{push_capped, TimingSummary};

use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const REQUESTS_TOTAL: &str = "proxy_pool_http_requests_total";
const REQUEST_DURATION: &str = "proxy_pool_http_request_duration_seconds";

/// Counters and latency samples of served requests.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    requests: AtomicU64,
    latency_ms: Mutex<VecDeque<i64>>,
    statuses: Mutex<BTreeMap<u16, u64>>,
}

/// Snapshot of [`RequestMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestReport {
    pub requests: u64,
    /// Latency in milliseconds.
    pub latency_ms: TimingSummary,
    /// Responses per status code.
    pub statuses: BTreeMap<u16, u64>,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one answered request.
    pub fn record(&self, status: u16, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let millis = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
        push_capped(&mut self.latency_ms.lock(), millis);
        *self.statuses.lock().entry(status).or_insert(0) += 1;

        metrics::counter!(REQUESTS_TOTAL, "status" => status.to_string()).increment(1);
        metrics::histogram!(REQUEST_DURATION).record(elapsed.as_secs_f64());
    }

    pub fn report(&self) -> RequestReport {
        let latency: Vec<i64> = self.latency_ms.lock().iter().copied().collect();
        RequestReport {
            requests: self.requests.load(Ordering::Relaxed),
            latency_ms: TimingSummary::from_samples(&latency),
            statuses: self.statuses.lock().clone(),
        }
    }
}

/// Serve the recorded metrics in Prometheus format on `addr`. Failure is
/// logged and the server carries on without an exporter.
pub fn install_exporter(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!("metrics exporter listening on {}", addr),
        Err(e) => warn!("cannot start metrics exporter on {}: {}", addr, e),
    }
}
