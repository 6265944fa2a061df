//! Batch orchestration.
//!
//! Runs a batch end-to-end: admission through the concurrency controller,
//! route dispatch, the middleware chain around the idempotency guard and
//! handler, retry/circuit-breaker decisions on failure, and visibility
//! monitoring throughout. Every message gets exactly one outcome; the
//! report lists the ids that need redelivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use bw_common::{
    Batch, BatchReport, Clock, HandlerError, Message, MessageOutcome, MessageResult,
    MonotonicClock,
};

use crate::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats};
use crate::concurrency::{ConcurrencyConfig, ConcurrencyController};
use crate::idempotency::{ClaimOutcome, IdempotencyGuard};
use crate::middleware::{Invoker, MiddlewareChain, MiddlewareContext};
use crate::retry::{ErrorClass, RetryConfig, RetryPolicy};
use crate::router::{
    Handler, Resolution, RouteError, Router, ScopedPayload, UnmatchedPolicy, ValidationPolicy,
};
use crate::visibility::{
    VisibilityConfig, VisibilityExtender, VisibilityStats, VisibilityTimeoutMonitor,
};

/// Terminal destination for messages that exhaust retries or fail permanently.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn push(&self, message: &Message, final_error: &HandlerError) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub visibility: VisibilityConfig,
    pub concurrency: ConcurrencyConfig,
    pub unmatched: UnmatchedPolicy,
    pub validation: ValidationPolicy,
}

/// On-demand snapshot of pipeline internals.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStats {
    pub visibility: VisibilityStats,
    pub breakers: Vec<CircuitBreakerStats>,
    pub active_workers: u32,
    pub peak_workers: u32,
}

pub struct BatchProcessor {
    router: Arc<Router>,
    middleware: MiddlewareChain,
    idempotency: Option<Arc<IdempotencyGuard>>,
    retry: RetryPolicy,
    breakers: Arc<CircuitBreakerRegistry>,
    visibility: Arc<VisibilityTimeoutMonitor>,
    concurrency: Arc<ConcurrencyController>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
}

impl BatchProcessor {
    pub fn new(router: Arc<Router>, config: PipelineConfig) -> Self {
        Self::with_clock(router, config, Arc::new(MonotonicClock))
    }

    pub fn with_clock(router: Arc<Router>, config: PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::with_clock(
            config.breaker.clone(),
            clock.clone(),
        ));
        let visibility = Arc::new(VisibilityTimeoutMonitor::with_clock(
            config.visibility.clone(),
            clock.clone(),
        ));
        let concurrency = Arc::new(ConcurrencyController::new(config.concurrency.clone()));
        let retry = RetryPolicy::new(config.retry.clone());

        Self {
            router,
            middleware: MiddlewareChain::new(),
            idempotency: None,
            retry,
            breakers,
            visibility,
            concurrency,
            dead_letter: None,
            config,
            clock,
        }
    }

    pub fn with_middleware(mut self, chain: MiddlewareChain) -> Self {
        self.middleware = chain;
        self
    }

    pub fn with_idempotency(mut self, guard: IdempotencyGuard) -> Self {
        self.idempotency = Some(Arc::new(guard));
        self
    }

    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Replace the retry policy, e.g. to install a custom error classifier.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_visibility_extender(mut self, extender: Arc<dyn VisibilityExtender>) -> Self {
        self.visibility = Arc::new(
            VisibilityTimeoutMonitor::with_clock(self.config.visibility.clone(), self.clock.clone())
                .with_extender(extender),
        );
        self
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            visibility: self.visibility.stats(),
            breakers: self.breakers.stats(),
            active_workers: self.concurrency.active_workers(),
            peak_workers: self.concurrency.peak_workers(),
        }
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyController> {
        &self.concurrency
    }

    /// Process one batch and report the ids that need redelivery.
    ///
    /// Groups run concurrently up to the configured cap; messages sharing a
    /// group key run sequentially in submission order. When the batch
    /// deadline elapses, unfinished messages are abandoned with a
    /// `DeadlineExceeded` outcome; any in-progress idempotency record they
    /// hold is left to expire via its TTL, since force-releasing could race
    /// a handler whose side effects already landed.
    pub async fn process_batch(self: &Arc<Self>, batch: Batch) -> BatchReport {
        if batch.is_empty() {
            return BatchReport {
                failed_ids: Vec::new(),
                results: Vec::new(),
            };
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        let deadline = batch.deadline;
        let submitted: Vec<String> = batch.messages.iter().map(|m| m.id.clone()).collect();
        let results: Arc<DashMap<String, MessageResult>> = Arc::new(DashMap::new());

        info!(
            batch_id = %batch_id,
            batch_size = batch.messages.len(),
            deadline_ms = deadline.as_millis() as u64,
            "Processing batch"
        );

        // Background visibility sweeps for the duration of the batch.
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let sweep = {
            let monitor = self.visibility.clone();
            let interval = monitor.check_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            monitor.check_in_flight().await;
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            })
        };

        // Partition by group key, preserving submission order. Untagged
        // messages are each their own group.
        let mut partitions: Vec<(Option<String>, Vec<Message>)> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();
        for message in batch.messages {
            match message.group_id.clone() {
                Some(group) => {
                    if let Some(&index) = group_index.get(&group) {
                        partitions[index].1.push(message);
                    } else {
                        group_index.insert(group.clone(), partitions.len());
                        partitions.push((Some(group), vec![message]));
                    }
                }
                None => partitions.push((None, vec![message])),
            }
        }

        let mut tasks = Vec::new();
        for (group, messages) in partitions {
            let processor = Arc::clone(self);
            let results = results.clone();
            tasks.push(tokio::spawn(async move {
                // Hold the group's lock for the whole run so a concurrent
                // batch sharing the group key cannot interleave.
                let _ordering_guard = match &group {
                    Some(group) => Some(processor.concurrency.lock_group(group).await),
                    None => None,
                };
                for message in messages {
                    let result = processor.process_message(&message).await;
                    results.insert(message.id.clone(), result);
                }
            }));
        }

        let abort_handles: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        match tokio::time::timeout(deadline, futures::future::join_all(tasks)).await {
            Ok(joins) => {
                for join in joins {
                    if let Err(join_error) = join {
                        if !join_error.is_cancelled() {
                            error!(error = %join_error, "Group task failed");
                        }
                    }
                }
            }
            Err(_) => {
                warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "Batch deadline elapsed, abandoning unfinished messages"
                );
                for handle in abort_handles {
                    handle.abort();
                }
            }
        }

        let _ = shutdown_tx.send(());
        let _ = sweep.await;
        self.concurrency.prune_group_locks();

        let mut failed_ids = Vec::new();
        let mut ordered = Vec::with_capacity(submitted.len());
        for id in &submitted {
            let result = match results.remove(id) {
                Some((_, result)) => result,
                None => {
                    self.visibility.abandon(id);
                    MessageResult {
                        message_id: id.clone(),
                        outcome: MessageOutcome::DeadlineExceeded,
                        result: None,
                        error: Some("batch deadline elapsed".to_string()),
                        attempts: 0,
                    }
                }
            };
            if self.is_failed(&result.outcome) {
                failed_ids.push(id.clone());
            }
            ordered.push(result);
        }

        info!(
            batch_id = %batch_id,
            batch_size = submitted.len(),
            failed = failed_ids.len(),
            "Batch complete"
        );

        BatchReport {
            failed_ids,
            results: ordered,
        }
    }

    fn is_failed(&self, outcome: &MessageOutcome) -> bool {
        match outcome {
            MessageOutcome::UnmatchedRoute => {
                matches!(self.config.unmatched, UnmatchedPolicy::Strict)
            }
            MessageOutcome::ValidationFailed => {
                matches!(self.config.validation, ValidationPolicy::Surface)
            }
            other => other.is_redeliverable(),
        }
    }

    async fn process_message(&self, message: &Message) -> MessageResult {
        self.visibility.track(&message.id);
        let result = self.run_message(message).await;
        self.visibility.complete(&message.id);
        result
    }

    async fn run_message(&self, message: &Message) -> MessageResult {
        let _slot = match self.concurrency.acquire().await {
            Ok(slot) => slot,
            Err(err) => {
                return MessageResult {
                    message_id: message.id.clone(),
                    outcome: MessageOutcome::TransientExhausted,
                    result: None,
                    error: Some(err.to_string()),
                    attempts: 0,
                };
            }
        };

        let resolution = match self.router.dispatch(&message.body) {
            Ok(resolution) => resolution,
            Err(RouteError::NotFound { value }) => {
                match self.config.unmatched {
                    UnmatchedPolicy::Strict => {
                        warn!(message_id = %message.id, value = ?value, "No route matched")
                    }
                    UnmatchedPolicy::Lenient => {
                        debug!(message_id = %message.id, value = ?value, "No route matched, dropping")
                    }
                }
                return MessageResult {
                    message_id: message.id.clone(),
                    outcome: MessageOutcome::UnmatchedRoute,
                    result: None,
                    error: Some(format!("no route for dispatch value {value:?}")),
                    attempts: 0,
                };
            }
            Err(RouteError::Validation { route, message: detail }) => {
                match self.config.validation {
                    ValidationPolicy::Surface => {
                        warn!(message_id = %message.id, route = %route, error = %detail, "Payload validation failed")
                    }
                    ValidationPolicy::Skip => {
                        debug!(message_id = %message.id, route = %route, error = %detail, "Payload validation failed, skipping")
                    }
                }
                return MessageResult {
                    message_id: message.id.clone(),
                    outcome: MessageOutcome::ValidationFailed,
                    result: None,
                    error: Some(detail),
                    attempts: 0,
                };
            }
        };

        debug!(message_id = %message.id, route = %resolution.label, "Route matched");
        self.execute_with_retry(message, &resolution).await
    }

    async fn execute_with_retry(
        &self,
        message: &Message,
        resolution: &Resolution,
    ) -> MessageResult {
        let breaker = self.breakers.for_route(&resolution.label);
        let max_attempts = self.retry.max_retries() + 1;

        // Admission is checked once per message: retries of an admitted
        // message are not new invocations. The breaker likewise records one
        // verdict per message, so its consecutive-failure counter counts
        // failed messages, not failed attempts.
        if let Err(open) = breaker.try_acquire() {
            warn!(
                message_id = %message.id,
                route = %resolution.label,
                retry_after_ms = open.retry_after.as_millis() as u64,
                "Rejected by open circuit"
            );
            return MessageResult {
                message_id: message.id.clone(),
                outcome: MessageOutcome::CircuitOpen,
                result: None,
                error: Some(open.to_string()),
                attempts: 0,
            };
        }

        let mut attempts: u32 = 0;

        // Loop iterations are bounded separately from handler invocations so
        // a middleware that fails in `before` cannot spin forever.
        let mut try_number = 0u32;
        loop {
            try_number += 1;

            let mut ctx = MiddlewareContext::new(&message.id, try_number, Instant::now());
            let key = self.idempotency.as_ref().map(|g| g.key_for(message));
            ctx.idempotency_key = key.clone();

            let invoker = PipelineInvoker {
                message: message.clone(),
                handler: resolution.handler.clone(),
                payload: resolution.payload.clone(),
                idempotency: self.idempotency.clone(),
                key,
                duplicate: Mutex::new(None),
                invoked: AtomicBool::new(false),
            };

            let outcome = self.middleware.run(&mut ctx, message, &invoker).await;

            if invoker.invoked.load(Ordering::SeqCst) {
                attempts += 1;
            }

            if let Some((dup_outcome, value)) = invoker.duplicate.lock().take() {
                // The handler never ran, so the breaker gets no verdict.
                breaker.release_probe();
                let result = match dup_outcome {
                    MessageOutcome::DuplicateCompleted => Some(value),
                    _ => None,
                };
                return MessageResult {
                    message_id: message.id.clone(),
                    outcome: dup_outcome,
                    result,
                    error: None,
                    attempts,
                };
            }

            match outcome {
                Ok(value) => {
                    breaker.record_success();
                    return MessageResult {
                        message_id: message.id.clone(),
                        outcome: MessageOutcome::Success,
                        result: Some(value),
                        error: None,
                        attempts,
                    };
                }
                Err(error) => {
                    match self.retry.classify(&error) {
                        ErrorClass::Permanent => {
                            breaker.record_failure();
                            self.push_dead_letter(message, &error).await;
                            return MessageResult {
                                message_id: message.id.clone(),
                                outcome: MessageOutcome::PermanentFailure,
                                result: None,
                                error: Some(error.to_string()),
                                attempts,
                            };
                        }
                        ErrorClass::Transient if try_number < max_attempts => {
                            let delay = self.retry.delay_for(try_number - 1);
                            warn!(
                                message_id = %message.id,
                                route = %resolution.label,
                                attempt = try_number,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "Retry scheduled"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        ErrorClass::Transient => {
                            breaker.record_failure();
                            self.push_dead_letter(message, &error).await;
                            return MessageResult {
                                message_id: message.id.clone(),
                                outcome: MessageOutcome::TransientExhausted,
                                result: None,
                                error: Some(error.to_string()),
                                attempts,
                            };
                        }
                    }
                }
            }
        }
    }

    async fn push_dead_letter(&self, message: &Message, error: &HandlerError) {
        if let Some(sink) = &self.dead_letter {
            match sink.push(message, error).await {
                Ok(()) => {
                    debug!(message_id = %message.id, "Message pushed to dead-letter sink")
                }
                Err(push_error) => warn!(
                    message_id = %message.id,
                    error = %push_error,
                    "Failed to push to dead-letter sink"
                ),
            }
        }
    }
}

/// One handler invocation with the idempotency guard wrapped around it,
/// executed between the middleware chain's before and after hooks.
struct PipelineInvoker {
    message: Message,
    handler: Arc<dyn Handler>,
    payload: ScopedPayload,
    idempotency: Option<Arc<IdempotencyGuard>>,
    key: Option<String>,
    duplicate: Mutex<Option<(MessageOutcome, Value)>>,
    invoked: AtomicBool,
}

#[async_trait]
impl Invoker for PipelineInvoker {
    async fn invoke(&self, ctx: &mut MiddlewareContext) -> Result<Value, HandlerError> {
        let (guard, key) = match (&self.idempotency, &self.key) {
            (Some(guard), Some(key)) => (guard, key),
            _ => {
                self.invoked.store(true, Ordering::SeqCst);
                return self.handler.handle(&self.message, &self.payload, ctx).await;
            }
        };

        match guard.claim(key).await {
            Ok(ClaimOutcome::Claimed) => {
                self.invoked.store(true, Ordering::SeqCst);
                let outcome = self.handler.handle(&self.message, &self.payload, ctx).await;
                match &outcome {
                    Ok(value) => guard.commit(key, value).await,
                    Err(_) => guard.release(key).await,
                }
                outcome
            }
            Ok(ClaimOutcome::InProgress) => {
                *self.duplicate.lock() =
                    Some((MessageOutcome::DuplicateInProgress, Value::Null));
                Ok(Value::Null)
            }
            Ok(ClaimOutcome::Completed(value)) => {
                *self.duplicate.lock() =
                    Some((MessageOutcome::DuplicateCompleted, value.clone()));
                Ok(value)
            }
            Err(store_error) => Err(HandlerError::transient(format!(
                "idempotency store: {store_error}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(
            &self,
            message: &Message,
            _payload: &ScopedPayload,
            _ctx: &mut MiddlewareContext,
        ) -> Result<Value, HandlerError> {
            Ok(json!({"id": message.id}))
        }
    }

    fn processor(unmatched: UnmatchedPolicy) -> Arc<BatchProcessor> {
        let mut router = Router::new("action");
        router.route("echo", Arc::new(Echo));
        let config = PipelineConfig {
            unmatched,
            ..Default::default()
        };
        Arc::new(BatchProcessor::new(Arc::new(router), config))
    }

    #[tokio::test]
    async fn empty_batch_yields_empty_report() {
        let processor = processor(UnmatchedPolicy::Strict);
        let report = processor
            .process_batch(Batch::new(Vec::new(), Duration::from_secs(5)))
            .await;
        assert!(report.is_clean());
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn strict_policy_reports_unmatched_as_failed() {
        let processor = processor(UnmatchedPolicy::Strict);
        let batch = Batch::new(
            vec![Message::new("m-1", json!({"action": "unknown"}))],
            Duration::from_secs(5),
        );
        let report = processor.process_batch(batch).await;
        assert_eq!(report.failed_ids, vec!["m-1"]);
        assert_eq!(
            report.result_for("m-1").unwrap().outcome,
            MessageOutcome::UnmatchedRoute
        );
    }

    #[tokio::test]
    async fn lenient_policy_drops_unmatched_silently() {
        let processor = processor(UnmatchedPolicy::Lenient);
        let batch = Batch::new(
            vec![
                Message::new("m-1", json!({"action": "unknown"})),
                Message::new("m-2", json!({"action": "echo"})),
            ],
            Duration::from_secs(5),
        );
        let report = processor.process_batch(batch).await;
        assert!(report.is_clean());
        assert_eq!(
            report.result_for("m-1").unwrap().outcome,
            MessageOutcome::UnmatchedRoute
        );
        assert_eq!(
            report.result_for("m-2").unwrap().outcome,
            MessageOutcome::Success
        );
    }

    #[tokio::test]
    async fn report_preserves_submission_order() {
        let processor = processor(UnmatchedPolicy::Strict);
        let batch = Batch::new(
            vec![
                Message::new("m-1", json!({"action": "echo"})),
                Message::new("m-2", json!({"action": "echo"})),
                Message::new("m-3", json!({"action": "echo"})),
            ],
            Duration::from_secs(5),
        );
        let report = processor.process_batch(batch).await;
        let ids: Vec<&str> = report.results.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);
    }
}
