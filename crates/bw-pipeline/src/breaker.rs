//! Per-route circuit breaking.
//!
//! One breaker instance per route label, shared by every concurrent
//! invocation of that route. Reaching the consecutive-failure threshold
//! opens the circuit for a cool-down; afterwards a single half-open probe
//! decides between closing and reopening.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use bw_common::{Clock, MonotonicClock};

use crate::error::CircuitOpenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    route: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        route: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            route: route.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                open_until: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Admission check before invoking the route's handler.
    ///
    /// Rejections are immediate and never consume retry budget. After the
    /// cool-down, exactly one caller is admitted as the half-open probe.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let open_until = inner.open_until.unwrap_or(now);
                if now >= open_until {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(route = %self.route, "Circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        route: self.route.clone(),
                        retry_after: open_until - now,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CircuitOpenError {
                        route: self.route.clone(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
                inner.open_until = None;
                info!(route = %self.route, "Circuit closed after successful probe");
            }
            // A late success from an invocation admitted before the circuit
            // opened does not bypass the cool-down.
            CircuitState::Open => {
                inner.consecutive_failures = 0;
            }
        }
    }

    /// Give back an admission that produced no verdict, e.g. the invocation
    /// short-circuited as an idempotent duplicate. A half-open probe becomes
    /// available to the next caller; a closed admission needs no bookkeeping.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(now);
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.open_until = Some(now + self.config.cool_down);
                inner.probe_in_flight = false;
                warn!(route = %self.route, "Probe failed, circuit reopened");
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.open_until = Some(now + self.config.cool_down);
                    warn!(
                        route = %self.route,
                        failures = inner.consecutive_failures,
                        cool_down_secs = self.config.cool_down.as_secs(),
                        "Circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// Per-route breaker instances, created on first use.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub route: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn for_route(&self, route: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(route.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    route,
                    self.config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|entry| CircuitBreakerStats {
                route: entry.key().clone(),
                state: entry.value().state(),
                consecutive_failures: entry.value().consecutive_failures(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bw_common::ManualClock;

    fn breaker(threshold: u32, cool_down: Duration) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(
            "orders",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cool_down,
            },
            clock.clone(),
        );
        (breaker, clock)
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let (breaker, _clock) = breaker(3, Duration::from_secs(30));

        for _ in 0..2 {
            breaker.try_acquire().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let (breaker, _clock) = breaker(3, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let (breaker, clock) = breaker(1, Duration::from_secs(10));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());

        clock.advance(Duration::from_secs(10));
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // A second arrival during the probe is still rejected.
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn probe_success_closes_probe_failure_reopens() {
        let (breaker, clock) = breaker(1, Duration::from_secs(10));

        breaker.record_failure();
        clock.advance(Duration::from_secs(10));
        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());

        clock.advance(Duration::from_secs(10));
        breaker.try_acquire().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn released_probe_is_available_to_the_next_caller() {
        let (breaker, clock) = breaker(1, Duration::from_secs(10));

        breaker.record_failure();
        clock.advance(Duration::from_secs(10));
        breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_err());

        // The probe ended without a verdict; the next caller may probe.
        breaker.release_probe();
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn rejection_reports_remaining_cool_down() {
        let (breaker, clock) = breaker(1, Duration::from_secs(30));

        breaker.record_failure();
        clock.advance(Duration::from_secs(10));
        let err = breaker.try_acquire().unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(20));
        assert_eq!(err.route, "orders");
    }

    #[test]
    fn registry_shares_one_breaker_per_route() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.for_route("orders");
        let b = registry.for_route("orders");
        let c = registry.for_route("payments");

        a.record_failure();
        assert_eq!(b.consecutive_failures(), 1);
        assert_eq!(c.consecutive_failures(), 0);
        assert_eq!(registry.stats().len(), 2);
    }
}
