//! Failure classification and exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use bw_common::HandlerError;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt (handler runs at most
    /// `max_retries + 1` times).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Add up to 25% random variance to each delay to avoid retry storms.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

type Classifier = Arc<dyn Fn(&HandlerError) -> ErrorClass + Send + Sync>;

/// Decides whether and when a failed invocation is retried.
pub struct RetryPolicy {
    config: RetryConfig,
    classifier: Classifier,
}

impl RetryPolicy {
    /// Policy with the default classifier: the `HandlerError` variant decides.
    pub fn new(config: RetryConfig) -> Self {
        Self::with_classifier(
            config,
            Arc::new(|error| match error {
                HandlerError::Transient(_) => ErrorClass::Transient,
                HandlerError::Permanent(_) => ErrorClass::Permanent,
            }),
        )
    }

    pub fn with_classifier(config: RetryConfig, classifier: Classifier) -> Self {
        Self { config, classifier }
    }

    pub fn classify(&self, error: &HandlerError) -> ErrorClass {
        (self.classifier)(error)
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Backoff before retry number `retry` (0-based):
    /// `base_delay * multiplier^retry`, capped at `max_delay`, jittered.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.config.multiplier.powi(retry as i32).max(0.0);
        let raw_secs = (self.config.base_delay.as_secs_f64() * factor)
            .min(self.config.max_delay.as_secs_f64());
        let mut delay = Duration::from_secs_f64(raw_secs);
        if self.config.jitter {
            let variance = rand::thread_rng().gen_range(0.0..0.25);
            delay = delay.mul_f64(1.0 + variance).min(self.config.max_delay);
        }
        delay
    }
}
