//! Internal statistics and reports about the pools.

use crate::index::StatusIndex;
use crate::proxy::{ProxyRecord, ProxyStatus, Segment};

use chrono::DateTime;
use log::info;
use parking_lot::Mutex;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::str::FromStr;

/// Samples kept per series and pool.
pub(crate) const SAMPLE_CAP: usize = 10_000;

/// Successful selections counted since `started_at`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestRate {
    pub started_at: i64,
    pub count: u64,
}

impl RequestRate {
    /// Selections per second up to `now`.
    pub fn per_second(&self, now: i64) -> f64 {
        let elapsed = now - self.started_at;
        if self.count == 0 || elapsed <= 0 {
            return self.count as f64;
        }
        self.count as f64 / elapsed as f64
    }
}

#[derive(Debug, Default)]
struct PoolSamples {
    postpone_deltas: VecDeque<i64>,
    success_usage: VecDeque<i64>,
    unavailable_at: VecDeque<i64>,
    request_rate: RequestRate,
}

pub(crate) fn push_capped(samples: &mut VecDeque<i64>, value: i64) {
    if samples.len() == SAMPLE_CAP {
        samples.pop_front();
    }
    samples.push_back(value);
}

/// Timing samples recorded by the manager, per pool.
///
/// Only the pools given at construction are tracked; samples for any other
/// name are dropped.
#[derive(Debug, Default)]
pub struct PoolStats {
    pools: Mutex<HashMap<String, PoolSamples>>,
}

impl PoolStats {
    /// Create sample buffers for the given pools.
    pub fn new<I, S>(pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pools = pools
            .into_iter()
            .map(|pool| (pool.into(), PoolSamples::default()))
            .collect();
        Self {
            pools: Mutex::new(pools),
        }
    }

    fn with_pool(&self, pool: &str, f: impl FnOnce(&mut PoolSamples)) {
        if let Some(samples) = self.pools.lock().get_mut(pool) {
            f(samples);
        }
    }

    /// Number of pools with sample buffers.
    pub fn tracked_pools(&self) -> usize {
        self.pools.lock().len()
    }

    /// Distance between a proxy's cycle start and its scheduled return.
    pub fn record_postpone(&self, pool: &str, delta: i64) {
        self.with_pool(pool, |samples| push_capped(&mut samples.postpone_deltas, delta));
    }

    /// Time a proxy spent in use before it was reported good.
    pub fn record_success_usage(&self, pool: &str, secs: i64) {
        self.with_pool(pool, |samples| push_capped(&mut samples.success_usage, secs));
    }

    /// A selection found no available proxy.
    pub fn record_unavailable(&self, pool: &str, at: i64) {
        self.with_pool(pool, |samples| push_capped(&mut samples.unavailable_at, at));
    }

    /// A selection succeeded. The window restarts whenever the count is zero.
    pub fn record_select(&self, pool: &str, now: i64) {
        self.with_pool(pool, |samples| {
            let rate = &mut samples.request_rate;
            if rate.count == 0 {
                rate.started_at = now;
            }
            rate.count += 1;
        });
    }

    pub fn reset_request_rate(&self, pool: &str) {
        self.with_pool(pool, |samples| samples.request_rate = RequestRate::default());
    }

    pub fn request_rate(&self, pool: &str) -> RequestRate {
        self.pools
            .lock()
            .get(pool)
            .map(|samples| samples.request_rate)
            .unwrap_or_default()
    }

    /// Summaries of every series for a pool.
    pub fn timings(&self, pool: &str) -> PoolTimings {
        let pools = self.pools.lock();
        let Some(samples) = pools.get(pool) else {
            return PoolTimings::default();
        };
        let collect = |series: &VecDeque<i64>| series.iter().copied().collect::<Vec<_>>();
        PoolTimings {
            postpone: TimingSummary::from_samples(&collect(&samples.postpone_deltas)),
            success_usage: TimingSummary::from_samples(&collect(&samples.success_usage)),
            unavailable_count: samples.unavailable_at.len(),
            last_unavailable: samples.unavailable_at.back().copied(),
            request_rate: samples.request_rate,
        }
    }
}

/// Snapshot of the timing series of one pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolTimings {
    pub postpone: TimingSummary,
    pub success_usage: TimingSummary,
    pub unavailable_count: usize,
    pub last_unavailable: Option<i64>,
    pub request_rate: RequestRate,
}

/// Integer summary of a series of seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimingSummary {
    pub min: i64,
    pub max: i64,
    pub mean: i64,
    pub median: i64,
    pub stdev: i64,
}

impl TimingSummary {
    /// Summarise `samples`; an empty series gives all zeros.
    pub fn from_samples(samples: &[i64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let len = sorted.len();
        let mean = sorted.iter().sum::<i64>() / len as i64;
        let median = if len % 2 == 0 {
            (sorted[len / 2 - 1] + sorted[len / 2]) / 2
        } else {
            sorted[len / 2]
        };
        // Population deviation, left at zero for tiny or zero-mean series.
        let stdev = if len > 2 && mean != 0 {
            let sum: f64 = sorted.iter().map(|v| ((v - mean) as f64).powi(2)).sum();
            (sum / len as f64).sqrt() as i64
        } else {
            0
        };

        Self {
            min: sorted[0],
            max: sorted[len - 1],
            mean,
            median,
            stdev,
        }
    }
}

/// Proxy counts of one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SegmentCounts {
    pub unchecked: usize,
    pub good: usize,
    pub busy: usize,
    pub postponed: usize,
    pub dead: usize,
    pub available: usize,
    pub total: usize,
}

impl SegmentCounts {
    fn collect(index: &StatusIndex, pool: &str, segment: Segment) -> Self {
        let count = |status| index.count_by_segment(pool, Some(status), segment);
        let mut counts = Self {
            unchecked: count(ProxyStatus::Unchecked),
            good: count(ProxyStatus::Good),
            busy: count(ProxyStatus::Busy),
            postponed: count(ProxyStatus::Postponed),
            dead: count(ProxyStatus::Dead),
            available: index.count_available_by_segment(pool, segment),
            total: 0,
        };
        counts.total = counts.available + counts.busy + counts.postponed + counts.dead;
        counts
    }

    /// Rows in display order.
    pub fn rows(&self) -> [(&'static str, usize); 7] {
        [
            ("good", self.good),
            ("unchecked", self.unchecked),
            ("available", self.available),
            ("busy", self.busy),
            ("postponed", self.postponed),
            ("dead", self.dead),
            ("total", self.total),
        ]
    }
}

/// Proxy counts of a pool split by provider origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PopulationCounts {
    pub all: SegmentCounts,
    pub rack: SegmentCounts,
    pub free: SegmentCounts,
}

impl PopulationCounts {
    pub fn collect(index: &StatusIndex, pool: &str) -> Self {
        Self {
            all: SegmentCounts::collect(index, pool, Segment::All),
            rack: SegmentCounts::collect(index, pool, Segment::Rack),
            free: SegmentCounts::collect(index, pool, Segment::Free),
        }
    }

    pub fn segment(&self, segment: Segment) -> &SegmentCounts {
        match segment {
            Segment::All => &self.all,
            Segment::Rack => &self.rack,
            Segment::Free => &self.free,
        }
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64 * 100.0
}

/// Write the population of a pool to the log.
pub fn log_population(pool: &str, counts: &PopulationCounts) {
    let total = counts.all.total;
    if total == 0 {
        info!("[{}] no data at all", pool);
        return;
    }
    for segment in Segment::ALL {
        for (status, proxies) in counts.segment(segment).rows() {
            info!(
                "[{}]-[{}]-[{}]-proxies {}, {:.2}",
                pool,
                segment.as_str(),
                status,
                proxies,
                percent(proxies, total)
            );
        }
    }
}

/// Render one HTML table per pool. Percentages are relative to the pool's
/// total.
pub fn render_html(pools: &[(String, PopulationCounts)]) -> String {
    let mut output = String::new();
    for (pool, counts) in pools {
        let _ = write!(output, "<br><br><strong>{}</strong><br>", pool);
        let total = counts.all.total;
        if total == 0 {
            output.push_str("<p>no data at all</p>");
            continue;
        }
        output.push_str(
            "<table><thead><tr><th>Status</th><th>Numbers all</th><th>%</th>\
             <th>Numbers free</th><th>% free</th><th>Numbers rack</th><th>% rack</th></tr></thead><tbody>",
        );
        let rows = counts
            .all
            .rows()
            .into_iter()
            .zip(counts.free.rows())
            .zip(counts.rack.rows());
        for (((status, all), (_, free)), (_, rack)) in rows {
            let _ = write!(
                output,
                "<tr><td>{}</td><td>{}</td><td>{:.0}</td><td>{}</td><td>{:.0}</td><td>{}</td><td>{:.0}</td></tr>",
                status,
                all,
                percent(all, total),
                free,
                percent(free, total),
                rack,
                percent(rack, total)
            );
        }
        output.push_str("</tbody></table>");
    }
    output
}

/// Ordering of the usefulness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsefulnessOrder {
    /// Proxy address, ascending.
    Name,
    /// Last success, newest first.
    SuccessDate,
    /// Success count, highest first.
    Success,
    /// Last failure, newest first.
    FailureDate,
    /// Failure count, highest first.
    Failure,
}

impl FromStr for UsefulnessOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(UsefulnessOrder::Name),
            "sdate" => Ok(UsefulnessOrder::SuccessDate),
            "success" => Ok(UsefulnessOrder::Success),
            "fdate" => Ok(UsefulnessOrder::FailureDate),
            "fail" => Ok(UsefulnessOrder::Failure),
            other => Err(format!("unknown order `{}`", other)),
        }
    }
}

/// RFC 3339 rendering of a unix time, or `never` for zero.
pub fn unix_time_string(secs: i64) -> String {
    if secs == 0 {
        return "never".to_string();
    }
    DateTime::from_timestamp(secs, 0)
        .map(|time| time.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

/// Quote a CSV field when it holds a separator, a quote or a line break.
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// CSV report of how useful each proxy has been. Ties keep address order.
pub fn usefulness_csv(mut records: Vec<(String, ProxyRecord)>, order: UsefulnessOrder) -> String {
    records.sort_by(|a, b| a.0.cmp(&b.0));
    match order {
        UsefulnessOrder::Name => {}
        UsefulnessOrder::SuccessDate => {
            records.sort_by(|a, b| b.1.last_successfully_used.cmp(&a.1.last_successfully_used))
        }
        UsefulnessOrder::Success => records
            .sort_by(|a, b| b.1.number_of_successful_uses.cmp(&a.1.number_of_successful_uses)),
        UsefulnessOrder::FailureDate => {
            records.sort_by(|a, b| b.1.last_failure_used.cmp(&a.1.last_failure_used))
        }
        UsefulnessOrder::Failure => {
            records.sort_by(|a, b| b.1.number_of_failures.cmp(&a.1.number_of_failures))
        }
    }

    let mut csv = String::from(
        "proxy,last_successfully_used,number_of_successful_uses,last_failure_used,number_of_failures\n",
    );
    for (proxy, record) in records {
        let _ = writeln!(
            csv,
            "{},{},{},{},{}",
            csv_field(&proxy),
            unix_time_string(record.last_successfully_used),
            record.number_of_successful_uses,
            unix_time_string(record.last_failure_used),
            record.number_of_failures
        );
    }
    csv
}
