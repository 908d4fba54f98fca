//! Backoff durations with jitter, in whole seconds.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Growth base of the failure backoff, in seconds.
pub const FAILURE_BACKOFF_BASE_SECS: f64 = 128.0;
/// Growth factor per failed attempt.
pub const FAILURE_BACKOFF_FACTOR: f64 = 16.0;
/// Ceiling of the failure backoff (30 days).
pub const FAILURE_BACKOFF_CAP_SECS: f64 = 2_592_000.0;

/// How a deterministic duration is spread before use.
///
/// The intended spread is `[0.5·v, 1.5·v]`. Earlier releases collapsed the
/// lower bound and drew from `[0, 1.5·v)`; `Legacy` reproduces that spread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    /// Uniform in `[0.5·v, 1.5·v]`.
    #[default]
    Symmetric,
    /// Uniform in `[0, 1.5·v)`.
    Legacy,
}

/// Randomise `value` according to `mode`. The result is truncated to
/// whole seconds.
pub fn random_uniform(value: f64, mode: JitterMode) -> i64 {
    if value <= 0.0 {
        return 0;
    }
    let mut rng = rand::rng();
    let secs = match mode {
        JitterMode::Symmetric => rng.random_range(0.5 * value..=1.5 * value),
        JitterMode::Legacy => rng.random::<f64>() * 1.5 * value,
    };
    secs as i64
}

/// Attempt count from which the failure backoff sits at its ceiling.
fn max_uncapped_attempts() -> i32 {
    ((FAILURE_BACKOFF_CAP_SECS / FAILURE_BACKOFF_BASE_SECS).ln() / FAILURE_BACKOFF_FACTOR.ln()) as i32
}

/// Deterministic failure backoff before jitter.
pub fn failure_backoff_ceiling(attempts: i32) -> f64 {
    if attempts <= max_uncapped_attempts() {
        FAILURE_BACKOFF_BASE_SECS * FAILURE_BACKOFF_FACTOR.powi(attempts.max(0))
    } else {
        FAILURE_BACKOFF_CAP_SECS
    }
}

/// Exponential backoff with full jitter for a proxy that failed `attempts`
/// times.
pub fn exp_backoff_full_jitter(attempts: i32, mode: JitterMode) -> i64 {
    random_uniform(failure_backoff_ceiling(attempts), mode)
}
