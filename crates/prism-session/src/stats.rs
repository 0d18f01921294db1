//! Per-session cache statistics.
//!
//! Counters are cheap enough to keep always-on. Each [`SessionCache`]
//! (crate::session::SessionCache) owns its own counters; parents do not
//! aggregate children, so a hierarchy reports one snapshot per scope.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Snapshot of one session cache's counters.
///
/// `evaluations` counts evaluator invocations including the failed ones;
/// `failed_evaluations` and `nan_results` are subsets. Evaluation times are
/// wall-clock and overlap when evaluators re-enter the cache, so totals are
/// an upper bound rather than an additive breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub result_hits: u64,
    pub result_misses: u64,
    pub evaluations: u64,
    pub anonymous_evaluations: u64,
    pub failed_evaluations: u64,
    pub nan_results: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub pool_len: u64,
    pub invalidations: u64,
    pub eval_time_total: Duration,
    pub eval_time_max: Duration,
}

impl SessionStats {
    pub fn to_report(&self) -> SessionStatsReport {
        SessionStatsReport::from(self)
    }
}

/// Serializable, wire-stable form of [`SessionStats`].
///
/// Durations are reported as integer milliseconds so the JSON shape stays
/// independent of `Duration`'s serde representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatsReport {
    pub result_hits: u64,
    pub result_misses: u64,
    pub evaluations: u64,
    pub anonymous_evaluations: u64,
    pub failed_evaluations: u64,
    pub nan_results: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub pool_len: u64,
    pub invalidations: u64,
    pub eval_time_total_ms: u64,
    pub eval_time_max_ms: u64,
}

fn duration_as_millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl From<&SessionStats> for SessionStatsReport {
    fn from(stats: &SessionStats) -> Self {
        Self {
            result_hits: stats.result_hits,
            result_misses: stats.result_misses,
            evaluations: stats.evaluations,
            anonymous_evaluations: stats.anonymous_evaluations,
            failed_evaluations: stats.failed_evaluations,
            nan_results: stats.nan_results,
            pool_hits: stats.pool_hits,
            pool_misses: stats.pool_misses,
            pool_len: stats.pool_len,
            invalidations: stats.invalidations,
            eval_time_total_ms: duration_as_millis_u64(stats.eval_time_total),
            eval_time_max_ms: duration_as_millis_u64(stats.eval_time_max),
        }
    }
}
