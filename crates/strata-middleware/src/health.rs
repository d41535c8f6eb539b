//! Pipeline health evaluation
//!
//! Health is an observability signal only: a degraded report is logged and
//! stored, nothing reacts to it automatically.

use crate::compiler::CompilerStats;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Below this many cache lookups the hit-rate is not judged
pub const MIN_LOOKUPS_FOR_HIT_RATE: u64 = 10;

/// Degradation thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    /// Cache hit-rate below this is degraded
    pub min_cache_hit_rate: f64,
    /// Execution error-rate above this is degraded
    pub max_error_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_cache_hit_rate: 0.5,
            max_error_rate: 0.1,
        }
    }
}

/// Result of one health evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Compiled-chain cache hit-rate
    pub cache_hit_rate: f64,
    /// Share of executions that left an error on the context
    pub error_rate: f64,
    /// Cache lookups so far
    pub lookups: u64,
    /// Chain executions so far
    pub executions: u64,
    /// Hit-rate below threshold
    pub cache_degraded: bool,
    /// Error-rate above threshold
    pub errors_degraded: bool,
    /// When the report was produced
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Evaluate counters against `thresholds`
    pub fn evaluate(
        thresholds: &HealthThresholds,
        compiler: &CompilerStats,
        executions: u64,
        execution_errors: u64,
    ) -> Self {
        let lookups = compiler.hits + compiler.misses;
        let error_rate = if executions == 0 {
            0.0
        } else {
            execution_errors as f64 / executions as f64
        };

        Self {
            cache_hit_rate: compiler.hit_rate,
            error_rate,
            lookups,
            executions,
            cache_degraded: lookups >= MIN_LOOKUPS_FOR_HIT_RATE
                && compiler.hit_rate < thresholds.min_cache_hit_rate,
            errors_degraded: error_rate > thresholds.max_error_rate,
            checked_at: Utc::now(),
        }
    }

    /// No degradation flagged
    pub fn is_healthy(&self) -> bool {
        !self.cache_degraded && !self.errors_degraded
    }
}
