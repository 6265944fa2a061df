use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};

// ============================================================================
// Core Message Types
// ============================================================================

/// A queue message admitted to the pipeline. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Structured payload; the router extracts its dispatch value from here.
    pub body: serde_json::Value,
    /// Messages sharing a group id are processed in submission order.
    pub group_id: Option<String>,
    pub attributes: HashMap<String, String>,
    pub enqueued_at: DateTime<Utc>,
}

impl Message {
    pub fn new(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            body,
            group_id: None,
            attributes: HashMap::new(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

/// An ordered batch of messages plus the deadline for processing all of them.
#[derive(Debug, Clone)]
pub struct Batch {
    pub messages: Vec<Message>,
    pub deadline: Duration,
}

impl Batch {
    pub fn new(messages: Vec<Message>, deadline: Duration) -> Self {
        Self { messages, deadline }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// ============================================================================
// Handler Error Surface
// ============================================================================

/// Error surface handlers report back to the pipeline.
///
/// The variant is the default transient/permanent classification; the retry
/// policy may override it with a custom predicate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("transient handler error: {0}")]
    Transient(String),

    #[error("permanent handler error: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
}

// ============================================================================
// Outcome Types
// ============================================================================

/// Final disposition of a single message. Recorded exactly once per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageOutcome {
    /// Handler ran and succeeded.
    Success,
    /// Another worker holds the in-progress idempotency claim; handler not invoked.
    DuplicateInProgress,
    /// A completed idempotency record was found; cached result returned.
    DuplicateCompleted,
    /// Transient failures exhausted the retry budget.
    TransientExhausted,
    /// Permanent failure; never retried.
    PermanentFailure,
    /// Rejected by an open circuit; handler not invoked.
    CircuitOpen,
    /// Payload failed schema validation.
    ValidationFailed,
    /// No route matched and no wildcard/default was registered.
    UnmatchedRoute,
    /// Abandoned when the batch deadline elapsed.
    DeadlineExceeded,
}

impl MessageOutcome {
    /// Whether the message should be reported for redelivery.
    ///
    /// Idempotent duplicates are excluded: the original invocation owns the
    /// outcome. Unmatched/validation outcomes are policy-filtered by the
    /// processor before this is consulted.
    pub fn is_redeliverable(&self) -> bool {
        matches!(
            self,
            MessageOutcome::TransientExhausted
                | MessageOutcome::PermanentFailure
                | MessageOutcome::CircuitOpen
                | MessageOutcome::DeadlineExceeded
        )
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            MessageOutcome::DuplicateInProgress | MessageOutcome::DuplicateCompleted
        )
    }
}

/// Per-message result collected into the batch report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResult {
    pub message_id: String,
    pub outcome: MessageOutcome,
    /// Handler result or cached idempotent result, when one exists.
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Handler invocations consumed (0 when the handler never ran).
    pub attempts: u32,
}

/// Partial-failure report for one processed batch.
///
/// `failed_ids` is the subset of submitted ids whose outcome requires
/// redelivery; successful and idempotent-duplicate messages never appear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub failed_ids: Vec<String>,
    pub results: Vec<MessageResult>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed_ids.is_empty()
    }

    pub fn result_for(&self, message_id: &str) -> Option<&MessageResult> {
        self.results.iter().find(|r| r.message_id == message_id)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BatchWorksError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, BatchWorksError>;
