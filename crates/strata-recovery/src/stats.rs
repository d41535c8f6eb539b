//! Running recovery statistics

use crate::classifier::ErrorCategory;
use crate::strategy::RecoveryAction;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-strategy usage
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StrategyStats {
    /// Times the strategy was selected
    pub usage_count: u64,
    /// Recoveries that succeeded
    pub success_count: u64,
    /// Recoveries that failed
    pub failure_count: u64,
    /// Running mean of recovery duration
    #[serde(with = "humantime_serde")]
    pub average_duration: Duration,
}

impl StrategyStats {
    fn record(&mut self, success: bool, duration: Duration) {
        self.usage_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }

        // cumulative moving average
        let n = i128::from(self.usage_count);
        let previous = self.average_duration.as_nanos() as i128;
        let updated = previous + (duration.as_nanos() as i128 - previous) / n;
        self.average_duration = Duration::from_nanos(updated.clamp(0, i128::from(u64::MAX)) as u64);
    }
}

/// Point-in-time view of the recovery counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStats {
    /// Recover calls that reached classification
    pub total_attempts: u64,
    /// Successful recoveries
    pub successes: u64,
    /// Failed recoveries
    pub failures: u64,
    /// successes / total_attempts, 0 when idle
    pub success_rate: f64,
    /// Results per action
    pub by_action: BTreeMap<String, u64>,
    /// Results per error category
    pub by_category: BTreeMap<String, u64>,
    /// Usage per strategy
    pub by_strategy: BTreeMap<String, StrategyStats>,
}

/// Lock-free counters plus a locked per-strategy table
#[derive(Debug)]
pub(crate) struct StatsCollector {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    by_action: [AtomicU64; RecoveryAction::ALL.len()],
    by_category: [AtomicU64; ErrorCategory::ALL.len()],
    by_strategy: RwLock<HashMap<String, StrategyStats>>,
}

impl StatsCollector {
    pub(crate) fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            by_action: std::array::from_fn(|_| AtomicU64::new(0)),
            by_category: std::array::from_fn(|_| AtomicU64::new(0)),
            by_strategy: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn record(
        &self,
        action: RecoveryAction,
        category: Option<ErrorCategory>,
        strategy: Option<&str>,
        success: bool,
        duration: Duration,
    ) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.by_action[action.index()].fetch_add(1, Ordering::Relaxed);
        if let Some(category) = category {
            self.by_category[category.index()].fetch_add(1, Ordering::Relaxed);
        }

        if let Some(name) = strategy {
            self.by_strategy
                .write()
                .entry(name.to_string())
                .or_default()
                .record(success, duration);
        }
    }

    pub(crate) fn snapshot(&self) -> RecoveryStats {
        let total = self.total.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);

        RecoveryStats {
            total_attempts: total,
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            success_rate: if total == 0 {
                0.0
            } else {
                successes as f64 / total as f64
            },
            by_action: RecoveryAction::ALL
                .iter()
                .map(|a| (a.name().to_string(), self.by_action[a.index()].load(Ordering::Relaxed)))
                .collect(),
            by_category: ErrorCategory::ALL
                .iter()
                .map(|c| {
                    (
                        c.name().to_string(),
                        self.by_category[c.index()].load(Ordering::Relaxed),
                    )
                })
                .collect(),
            by_strategy: self
                .by_strategy
                .read()
                .iter()
                .map(|(name, stats)| (name.clone(), stats.clone()))
                .collect(),
        }
    }
}
