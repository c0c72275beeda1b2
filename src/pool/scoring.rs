//! Health scoring model.
//!
//! Kept free of storage so the invariants can be checked directly:
//! `score` stays within `[0, 100]` and `avg_latency_ms` is either
//! [`NO_LATENCY`] or non-negative.

use chrono::{DateTime, Utc};

use super::model::{Proxy, ProxyStatus, NO_LATENCY};

/// Weight of the previous average in the latency EMA.
pub const EMA_OLD_WEIGHT: f64 = 0.6;
/// Weight of the new sample in the latency EMA.
pub const EMA_NEW_WEIGHT: f64 = 0.4;
/// Latency at which the penalty reaches 1.0 before capping.
pub const LATENCY_PENALTY_SCALE_MS: f64 = 3000.0;
/// Upper bound on the latency penalty.
pub const MAX_LATENCY_PENALTY: f64 = 0.7;
/// Failures tolerated before a never-successful proxy is marked down.
pub const DOWN_AFTER_FAILURES: u64 = 3;

/// Fold one latency sample into the running average.
pub fn ema(previous: f64, sample: f64) -> f64 {
    if previous < 0.0 {
        sample
    } else {
        EMA_OLD_WEIGHT * previous + EMA_NEW_WEIGHT * sample
    }
}

/// Score in `[0, 100]` from counters and average latency.
pub fn score(success_count: u64, fail_count: u64, avg_latency_ms: f64) -> f64 {
    let total = (success_count + fail_count).max(1) as f64;
    let success_ratio = success_count as f64 / total;
    let latency_penalty = if avg_latency_ms >= 0.0 {
        (avg_latency_ms / LATENCY_PENALTY_SCALE_MS).min(MAX_LATENCY_PENALTY)
    } else {
        0.0
    };
    (100.0 * success_ratio * (1.0 - latency_penalty)).clamp(0.0, 100.0)
}

/// Apply one probe outcome to `proxy` in place.
///
/// A proxy that has ever succeeded is never marked down here; repeated
/// failures only erode its score.
pub fn apply_outcome(proxy: &mut Proxy, ok: bool, latency_ms: Option<f64>, now: DateTime<Utc>) {
    if ok {
        proxy.success_count += 1;
        proxy.status = ProxyStatus::Up;
        proxy.last_ok = Some(now);
        if let Some(sample) = latency_ms.filter(|l| *l >= 0.0 && l.is_finite()) {
            proxy.avg_latency_ms = ema(proxy.avg_latency_ms, sample);
        }
    } else {
        proxy.fail_count += 1;
        if proxy.fail_count > DOWN_AFTER_FAILURES && proxy.success_count == 0 {
            proxy.status = ProxyStatus::Down;
        }
    }
    if proxy.avg_latency_ms < 0.0 {
        proxy.avg_latency_ms = NO_LATENCY;
    }
    proxy.last_checked = Some(now);
    proxy.score = score(proxy.success_count, proxy.fail_count, proxy.avg_latency_ms);
}
