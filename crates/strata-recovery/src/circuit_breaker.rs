//! Circuit breaker pattern implementation

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Name of the breaker used when no boundary is given
pub const GLOBAL_BREAKER: &str = "global";

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, all requests fail immediately
    Open,
    /// Circuit is half-open, probing whether the boundary recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub max_failures: u32,
    /// Time the circuit stays open before a probe is allowed
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Allow exactly one request while half-open
    pub single_probe: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 10,
            timeout: Duration::from_secs(30),
            single_probe: false,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Failures counted toward opening
    pub failure_count: u32,
    /// Time of the most recent failure
    pub last_failure: Option<DateTime<Utc>>,
    /// Failures reported over the breaker's lifetime
    pub total_failures: u64,
    /// Successes reported over the breaker's lifetime
    pub total_successes: u64,
    /// Requests denied
    pub rejected: u64,
}

/// Three-state breaker guarding one boundary
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerState>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    rejected: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(BreakerState::new()),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    /// Failures counted toward opening
    pub fn failure_count(&self) -> u32 {
        self.inner.read().failure_count
    }

    /// Check if a request should be allowed.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open and lets
    /// the calling request through as a probe.
    pub fn allow_request(&self) -> bool {
        if self.state() == CircuitState::Closed {
            return true;
        }

        let mut inner = self.inner.write();
        let allowed = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.config.timeout);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = self.config.single_probe;
                    info!(breaker = %self.name, "Circuit breaker transitioned to HALF-OPEN");
                }
                cooled_down
            }
            CircuitState::HalfOpen => {
                if self.config.single_probe {
                    if inner.probe_in_flight {
                        false
                    } else {
                        inner.probe_in_flight = true;
                        true
                    }
                } else {
                    true
                }
            }
        };

        if !allowed {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(breaker = %self.name, state = %inner.state, "Circuit breaker rejected request");
        }
        allowed
    }

    /// Record a successful request
    pub fn on_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.write();
        inner.failure_count = 0;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            info!(breaker = %self.name, "Circuit breaker transitioned to CLOSED");
        }
    }

    /// Record a failed request
    pub fn on_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.write();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.probe_in_flight = false;

        let should_open = match inner.state {
            CircuitState::Closed => inner.failure_count >= self.config.max_failures,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            inner.state = CircuitState::Open;
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                "Circuit breaker transitioned to OPEN"
            );
        }
    }

    /// Give back a half-open probe slot without reporting an outcome
    pub fn release_probe(&self) {
        let mut inner = self.inner.write();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Reset the circuit breaker
    pub fn reset(&self) {
        *self.inner.write() = BreakerState::new();
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Get current metrics
    pub fn snapshot(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.read();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure: inner.last_failure_at,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Named breakers, one per protected boundary, created on first use
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers use `defaults`
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Use `config` for the breaker called `name`
    pub fn with_override(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    /// Get or create the breaker for `name`
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(breaker.value());
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                debug!(breaker = %name, "Circuit breaker created");
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    /// The process-wide default breaker
    pub fn global(&self) -> Arc<CircuitBreaker> {
        self.get(GLOBAL_BREAKER)
    }

    /// Get metrics for all breakers, sorted by name
    pub fn snapshot_all(&self) -> Vec<CircuitBreakerMetrics> {
        let mut all: Vec<CircuitBreakerMetrics> =
            self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Reset all circuit breakers
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
        info!("All circuit breakers reset");
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
