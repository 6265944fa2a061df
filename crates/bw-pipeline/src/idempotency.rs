//! Duplicate-execution suppression.
//!
//! A message claims its idempotency key before the handler runs. The claim
//! is an atomic compare-and-set against the backing store, which is what
//! prevents duplicate side effects across concurrent workers or processes.
//! On success the result is committed and served to later duplicates; on
//! failure the claim is released so a future attempt may retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use bw_common::{BatchWorksError, Clock, Message, MonotonicClock};

/// Lifecycle state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: RecordStatus,
    /// Cached handler result, present iff completed.
    pub result: Option<Value>,
    pub expires_at: Instant,
}

/// Result of attempting to claim a key.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// Key is ours; proceed to invoke the handler.
    Claimed,
    /// Another invocation holds the in-progress claim.
    InProgress,
    /// A previous invocation completed; here is its cached result.
    Completed(Value),
}

/// Pluggable key/value backend.
///
/// `claim` must be atomic: for a given key, at most one concurrent caller
/// may observe `Claimed` until the claim is committed, released, or expires.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, BatchWorksError>;

    async fn commit(&self, key: &str, result: Value, ttl: Duration)
        -> Result<(), BatchWorksError>;

    /// Remove an in-progress claim so a future attempt may retry.
    async fn release(&self, key: &str) -> Result<(), BatchWorksError>;

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, BatchWorksError>;
}

/// In-memory store for single-process deployments. The DashMap entry API
/// provides the per-key compare-and-set.
pub struct MemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop expired records. Expiry is also checked lazily on claim, so this
    /// only reclaims memory.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.records.retain(|_, record| record.expires_at > now);
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, BatchWorksError> {
        let now = self.clock.now();
        let fresh = IdempotencyRecord {
            key: key.to_string(),
            status: RecordStatus::InProgress,
            result: None,
            expires_at: now + ttl,
        };

        // The entry holds the shard lock for the whole decision, making the
        // read-modify-write atomic per key.
        match self.records.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                Ok(ClaimOutcome::Claimed)
            }
            Entry::Occupied(mut slot) => {
                let expired = slot.get().expires_at <= now;
                let status = slot.get().status;
                if expired {
                    slot.insert(fresh);
                    return Ok(ClaimOutcome::Claimed);
                }
                match status {
                    RecordStatus::InProgress => Ok(ClaimOutcome::InProgress),
                    RecordStatus::Completed => Ok(ClaimOutcome::Completed(
                        slot.get().result.clone().unwrap_or(Value::Null),
                    )),
                    // A failed marker no longer guards anything; reclaim it.
                    RecordStatus::Failed => {
                        slot.insert(fresh);
                        Ok(ClaimOutcome::Claimed)
                    }
                }
            }
        }
    }

    async fn commit(
        &self,
        key: &str,
        result: Value,
        ttl: Duration,
    ) -> Result<(), BatchWorksError> {
        let expires_at = self.clock.now() + ttl;
        self.records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                status: RecordStatus::Completed,
                result: Some(result),
                expires_at,
            },
        );
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), BatchWorksError> {
        self.records.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, BatchWorksError> {
        Ok(self.records.get(key).map(|r| r.clone()))
    }
}

// ============================================================================
// Key Derivation
// ============================================================================

/// How an idempotency key is derived from a message.
#[derive(Debug, Clone)]
pub enum KeySpec {
    /// Use the message id directly.
    MessageId,
    /// SHA-256 over the named top-level payload fields (canonical order).
    PayloadFields(Vec<String>),
}

impl KeySpec {
    pub fn derive(&self, message: &Message) -> String {
        match self {
            KeySpec::MessageId => message.id.clone(),
            KeySpec::PayloadFields(fields) => {
                let mut sorted: Vec<&String> = fields.iter().collect();
                sorted.sort();

                let mut hasher = Sha256::new();
                for field in sorted {
                    let value = message.body.get(field).cloned().unwrap_or(Value::Null);
                    hasher.update(field.as_bytes());
                    hasher.update(b"=");
                    hasher.update(value.to_string().as_bytes());
                    hasher.update(b"\n");
                }
                hex::encode(hasher.finalize())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub ttl: Duration,
    pub key_spec: KeySpec,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            key_spec: KeySpec::MessageId,
        }
    }
}

/// Deduplicates handler execution using a pluggable store.
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn key_for(&self, message: &Message) -> String {
        self.config.key_spec.derive(message)
    }

    pub async fn claim(&self, key: &str) -> Result<ClaimOutcome, BatchWorksError> {
        let outcome = self.store.claim(key, self.config.ttl).await?;
        match &outcome {
            ClaimOutcome::InProgress => {
                debug!(key = %key, "Idempotent duplicate detected: in progress elsewhere");
            }
            ClaimOutcome::Completed(_) => {
                debug!(key = %key, "Idempotent duplicate detected: serving cached result");
            }
            ClaimOutcome::Claimed => {}
        }
        Ok(outcome)
    }

    pub async fn commit(&self, key: &str, result: &Value) {
        if let Err(error) = self.store.commit(key, result.clone(), self.config.ttl).await {
            warn!(key = %key, error = %error, "Failed to commit idempotency record");
        }
    }

    pub async fn release(&self, key: &str) {
        if let Err(error) = self.store.release(key).await {
            warn!(key = %key, error = %error, "Failed to release idempotency claim");
        }
    }
}
