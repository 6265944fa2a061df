//! Visibility-timeout monitoring for in-flight messages.
//!
//! Tracks elapsed processing time against each message's visibility
//! deadline, warns when remaining time runs low, and optionally asks a
//! best-effort collaborator to extend the deadline. Observation happens in
//! a periodic sweep driven from outside, so it never blocks or delays
//! handler execution.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use bw_common::{Clock, MonotonicClock};

const DURATION_WINDOW: usize = 1024;

#[derive(Debug, Clone)]
pub struct VisibilityConfig {
    /// Deadline applied to messages tracked without an explicit one.
    pub default_timeout: Duration,
    /// Warn when remaining time falls below this fraction of the deadline.
    pub warning_fraction: f64,
    /// How far a successful extension pushes the deadline out.
    pub extend_by: Duration,
    /// Sweep cadence for the background check.
    pub check_interval: Duration,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            warning_fraction: 0.2,
            extend_by: Duration::from_secs(120),
            check_interval: Duration::from_secs(5),
        }
    }
}

/// Best-effort deadline extension against the external queue service.
#[async_trait]
pub trait VisibilityExtender: Send + Sync {
    async fn extend(&self, message_id: &str, extend_by: Duration) -> anyhow::Result<()>;
}

struct InFlightEntry {
    started_at: Instant,
    deadline: Duration,
    warned: bool,
}

/// Aggregate monitoring snapshot, retrievable on demand.
#[derive(Debug, Clone, Serialize)]
pub struct VisibilityStats {
    pub in_flight: usize,
    pub warnings: u64,
    pub completed: u64,
    pub avg_processing_ms: u64,
    pub p95_processing_ms: u64,
}

pub struct VisibilityTimeoutMonitor {
    config: VisibilityConfig,
    clock: Arc<dyn Clock>,
    extender: Option<Arc<dyn VisibilityExtender>>,
    in_flight: DashMap<String, InFlightEntry>,
    warning_count: AtomicU64,
    completed_count: AtomicU64,
    durations_ms: Mutex<VecDeque<u64>>,
}

impl VisibilityTimeoutMonitor {
    pub fn new(config: VisibilityConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    pub fn with_clock(config: VisibilityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            extender: None,
            in_flight: DashMap::new(),
            warning_count: AtomicU64::new(0),
            completed_count: AtomicU64::new(0),
            durations_ms: Mutex::new(VecDeque::with_capacity(DURATION_WINDOW)),
        }
    }

    pub fn with_extender(mut self, extender: Arc<dyn VisibilityExtender>) -> Self {
        self.extender = Some(extender);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.config.check_interval
    }

    /// Begin tracking a message under the default visibility timeout.
    pub fn track(&self, message_id: &str) {
        self.track_with_deadline(message_id, self.config.default_timeout);
    }

    pub fn track_with_deadline(&self, message_id: &str, deadline: Duration) {
        self.in_flight.insert(
            message_id.to_string(),
            InFlightEntry {
                started_at: self.clock.now(),
                deadline,
                warned: false,
            },
        );
    }

    /// Stop tracking and record the processing duration.
    pub fn complete(&self, message_id: &str) {
        if let Some((_, entry)) = self.in_flight.remove(message_id) {
            let elapsed_ms = (self.clock.now() - entry.started_at).as_millis() as u64;
            self.completed_count.fetch_add(1, Ordering::Relaxed);
            let mut durations = self.durations_ms.lock();
            if durations.len() == DURATION_WINDOW {
                durations.pop_front();
            }
            durations.push_back(elapsed_ms);
        }
    }

    /// Stop tracking without recording stats (deadline abandonment).
    pub fn abandon(&self, message_id: &str) {
        self.in_flight.remove(message_id);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Sweep in-flight messages: warn on those running low and ask the
    /// extender (when present) to push their deadlines out.
    pub async fn check_in_flight(&self) {
        let now = self.clock.now();
        let mut low = Vec::new();

        for mut entry in self.in_flight.iter_mut() {
            let value = entry.value();
            if value.warned {
                continue;
            }
            let elapsed = now - value.started_at;
            let remaining = value.deadline.saturating_sub(elapsed);
            let threshold = value.deadline.mul_f64(self.config.warning_fraction);
            if remaining <= threshold {
                entry.value_mut().warned = true;
                low.push((entry.key().clone(), elapsed, remaining));
            }
        }

        for (message_id, elapsed, remaining) in low {
            self.warning_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_id = %message_id,
                elapsed_ms = elapsed.as_millis() as u64,
                remaining_ms = remaining.as_millis() as u64,
                "Message approaching visibility timeout"
            );

            if let Some(extender) = &self.extender {
                match extender.extend(&message_id, self.config.extend_by).await {
                    Ok(()) => {
                        if let Some(mut entry) = self.in_flight.get_mut(&message_id) {
                            entry.deadline += self.config.extend_by;
                            entry.warned = false;
                        }
                        debug!(
                            message_id = %message_id,
                            extend_by_secs = self.config.extend_by.as_secs(),
                            "Extended visibility for in-flight message"
                        );
                    }
                    Err(error) => {
                        warn!(
                            message_id = %message_id,
                            error = %error,
                            "Failed to extend visibility"
                        );
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> VisibilityStats {
        let durations = self.durations_ms.lock();
        let (avg, p95) = if durations.is_empty() {
            (0, 0)
        } else {
            let sum: u64 = durations.iter().sum();
            let mut sorted: Vec<u64> = durations.iter().copied().collect();
            sorted.sort_unstable();
            let index = (sorted.len() - 1) * 95 / 100;
            (sum / durations.len() as u64, sorted[index])
        };

        VisibilityStats {
            in_flight: self.in_flight.len(),
            warnings: self.warning_count.load(Ordering::Relaxed),
            completed: self.completed_count.load(Ordering::Relaxed),
            avg_processing_ms: avg,
            p95_processing_ms: p95,
        }
    }
}
