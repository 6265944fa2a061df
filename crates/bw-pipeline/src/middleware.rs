//! Ordered before/after/error hooks wrapped around handler invocation.
//!
//! `before` hooks run in registration order; `after` and `on_error` run in
//! reverse registration order (stack discipline). For every middleware whose
//! `before` completed, exactly one paired `after`-or-`on_error` call is made
//! on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use bw_common::{HandlerError, Message};

/// Mutable, message-scoped state bag. Lives for one processing attempt.
pub struct MiddlewareContext {
    pub message_id: String,
    /// 1-based attempt number for this invocation.
    pub attempt: u32,
    pub started_at: Instant,
    pub idempotency_key: Option<String>,
    values: HashMap<String, Value>,
}

impl MiddlewareContext {
    pub fn new(message_id: impl Into<String>, attempt: u32, started_at: Instant) -> Self {
        Self {
            message_id: message_id.into(),
            attempt,
            started_at,
            idempotency_key: None,
            values: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// What an `on_error` hook decided about a failure.
pub enum ErrorDisposition {
    /// Treat the error as handled; the value becomes the invocation result.
    Suppress(Value),
    /// Let the error continue to outer middleware and the retry policy.
    Propagate,
}

/// A single middleware stage. All hooks default to no-ops.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn before(
        &self,
        _ctx: &mut MiddlewareContext,
        _message: &Message,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn after(&self, _ctx: &mut MiddlewareContext, _result: &Value) {}

    async fn on_error(
        &self,
        _ctx: &mut MiddlewareContext,
        _error: &HandlerError,
    ) -> ErrorDisposition {
        ErrorDisposition::Propagate
    }
}

/// The work the chain wraps: one handler invocation (plus whatever guards
/// the orchestrator places around it).
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, ctx: &mut MiddlewareContext) -> Result<Value, HandlerError>;
}

/// Ordered middleware stages driven by a single orchestrator.
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    stages: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.stages.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run one invocation inside the chain.
    ///
    /// A `before` failure skips the invocation and unwinds only the stages
    /// that already entered. An `on_error` suppression converts the failure
    /// into a success for the remaining (outer) stages.
    pub async fn run(
        &self,
        ctx: &mut MiddlewareContext,
        message: &Message,
        invoker: &dyn Invoker,
    ) -> Result<Value, HandlerError> {
        let mut entered = 0;
        let mut outcome: Option<Result<Value, HandlerError>> = None;

        for stage in &self.stages {
            match stage.before(ctx, message).await {
                Ok(()) => entered += 1,
                Err(error) => {
                    warn!(
                        message_id = %ctx.message_id,
                        middleware = %stage.name(),
                        error = %error,
                        "Middleware before hook failed"
                    );
                    outcome = Some(Err(error));
                    break;
                }
            }
        }

        let mut outcome = match outcome {
            Some(result) => result,
            None => invoker.invoke(ctx).await,
        };

        for stage in self.stages[..entered].iter().rev() {
            outcome = match outcome {
                Ok(value) => {
                    stage.after(ctx, &value).await;
                    Ok(value)
                }
                Err(error) => match stage.on_error(ctx, &error).await {
                    ErrorDisposition::Suppress(value) => {
                        debug!(
                            message_id = %ctx.message_id,
                            middleware = %stage.name(),
                            "Error suppressed by middleware"
                        );
                        Ok(value)
                    }
                    ErrorDisposition::Propagate => Err(error),
                },
            };
        }

        outcome
    }
}

// ============================================================================
// Built-in Middleware
// ============================================================================

/// Structured request/result logging with payload field masking.
pub struct LoggingMiddleware {
    mask_fields: Vec<String>,
}

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self {
            mask_fields: Vec::new(),
        }
    }

    pub fn with_masked_fields(fields: Vec<String>) -> Self {
        Self {
            mask_fields: fields,
        }
    }

    fn masked(&self, payload: &Value) -> Value {
        if self.mask_fields.is_empty() {
            return payload.clone();
        }
        let mut copy = payload.clone();
        Self::mask_in_place(&mut copy, &self.mask_fields);
        copy
    }

    fn mask_in_place(value: &mut Value, fields: &[String]) {
        match value {
            Value::Object(map) => {
                for (key, entry) in map.iter_mut() {
                    if fields.iter().any(|f| f == key) {
                        *entry = Value::String("***".to_string());
                    } else {
                        Self::mask_in_place(entry, fields);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    Self::mask_in_place(item, fields);
                }
            }
            _ => {}
        }
    }
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before(
        &self,
        ctx: &mut MiddlewareContext,
        message: &Message,
    ) -> Result<(), HandlerError> {
        info!(
            message_id = %ctx.message_id,
            attempt = ctx.attempt,
            age_ms = message.age().num_milliseconds(),
            payload = %self.masked(&message.body),
            "Processing message"
        );
        Ok(())
    }

    async fn after(&self, ctx: &mut MiddlewareContext, _result: &Value) {
        info!(message_id = %ctx.message_id, "Message processed");
    }

    async fn on_error(
        &self,
        ctx: &mut MiddlewareContext,
        error: &HandlerError,
    ) -> ErrorDisposition {
        warn!(message_id = %ctx.message_id, error = %error, "Message failed");
        ErrorDisposition::Propagate
    }
}

/// Records elapsed processing milliseconds into the context under `timing_ms`.
pub struct TimingMiddleware;

#[async_trait]
impl Middleware for TimingMiddleware {
    fn name(&self) -> &str {
        "timing"
    }

    async fn after(&self, ctx: &mut MiddlewareContext, _result: &Value) {
        let elapsed_ms = ctx.started_at.elapsed().as_millis() as u64;
        ctx.set("timing_ms", Value::from(elapsed_ms));
        debug!(message_id = %ctx.message_id, elapsed_ms, "Handler timing");
    }

    async fn on_error(
        &self,
        ctx: &mut MiddlewareContext,
        _error: &HandlerError,
    ) -> ErrorDisposition {
        let elapsed_ms = ctx.started_at.elapsed().as_millis() as u64;
        ctx.set("timing_ms", Value::from(elapsed_ms));
        ErrorDisposition::Propagate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recording {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_before: bool,
        suppress_with: Option<Value>,
    }

    impl Recording {
        fn new(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                label,
                log,
                fail_before: false,
                suppress_with: None,
            })
        }
    }

    #[async_trait]
    impl Middleware for Recording {
        fn name(&self) -> &str {
            self.label
        }

        async fn before(
            &self,
            _ctx: &mut MiddlewareContext,
            _message: &Message,
        ) -> Result<(), HandlerError> {
            self.log.lock().push(format!("before:{}", self.label));
            if self.fail_before {
                return Err(HandlerError::permanent("before failed"));
            }
            Ok(())
        }

        async fn after(&self, _ctx: &mut MiddlewareContext, _result: &Value) {
            self.log.lock().push(format!("after:{}", self.label));
        }

        async fn on_error(
            &self,
            _ctx: &mut MiddlewareContext,
            _error: &HandlerError,
        ) -> ErrorDisposition {
            self.log.lock().push(format!("error:{}", self.label));
            match &self.suppress_with {
                Some(value) => ErrorDisposition::Suppress(value.clone()),
                None => ErrorDisposition::Propagate,
            }
        }
    }

    struct Fixed(Result<Value, HandlerError>);

    #[async_trait]
    impl Invoker for Fixed {
        async fn invoke(&self, _ctx: &mut MiddlewareContext) -> Result<Value, HandlerError> {
            self.0.clone()
        }
    }

    struct MustNotRun;

    #[async_trait]
    impl Invoker for MustNotRun {
        async fn invoke(&self, _ctx: &mut MiddlewareContext) -> Result<Value, HandlerError> {
            panic!("handler must not run")
        }
    }

    fn test_message() -> Message {
        Message::new("m-1", json!({"action": "create"}))
    }

    fn test_ctx() -> MiddlewareContext {
        MiddlewareContext::new("m-1", 1, Instant::now())
    }

    #[tokio::test]
    async fn after_hooks_run_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.add(Recording::new("a", log.clone()));
        chain.add(Recording::new("b", log.clone()));

        let msg = test_message();
        let mut ctx = test_ctx();
        let result = chain.run(&mut ctx, &msg, &Fixed(Ok(json!("ok")))).await;

        assert!(result.is_ok());
        assert_eq!(
            *log.lock(),
            vec!["before:a", "before:b", "after:b", "after:a"]
        );
    }

    #[tokio::test]
    async fn error_hooks_unwind_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.add(Recording::new("a", log.clone()));
        chain.add(Recording::new("b", log.clone()));

        let msg = test_message();
        let mut ctx = test_ctx();
        let result = chain
            .run(&mut ctx, &msg, &Fixed(Err(HandlerError::transient("boom"))))
            .await;

        assert!(result.is_err());
        assert_eq!(
            *log.lock(),
            vec!["before:a", "before:b", "error:b", "error:a"]
        );
    }

    #[tokio::test]
    async fn suppression_turns_failure_into_success_for_outer_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.add(Recording::new("outer", log.clone()));
        chain.add(Arc::new(Recording {
            label: "inner",
            log: log.clone(),
            fail_before: false,
            suppress_with: Some(json!("recovered")),
        }));

        let msg = test_message();
        let mut ctx = test_ctx();
        let result = chain
            .run(&mut ctx, &msg, &Fixed(Err(HandlerError::transient("boom"))))
            .await;

        assert_eq!(result.unwrap(), json!("recovered"));
        // Inner suppressed, so outer sees a success and runs `after`.
        assert_eq!(
            *log.lock(),
            vec!["before:outer", "before:inner", "error:inner", "after:outer"]
        );
    }

    #[tokio::test]
    async fn before_failure_unwinds_only_entered_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.add(Recording::new("a", log.clone()));
        chain.add(Arc::new(Recording {
            label: "b",
            log: log.clone(),
            fail_before: true,
            suppress_with: None,
        }));
        chain.add(Recording::new("c", log.clone()));

        let msg = test_message();
        let mut ctx = test_ctx();
        let result = chain.run(&mut ctx, &msg, &MustNotRun).await;

        assert!(result.is_err());
        // Stage c never entered, stage b failed its own before; only a unwinds.
        assert_eq!(*log.lock(), vec!["before:a", "before:b", "error:a"]);
    }

    #[tokio::test]
    async fn logging_middleware_masks_configured_fields() {
        let mw = LoggingMiddleware::with_masked_fields(vec!["password".to_string()]);
        let masked = mw.masked(&json!({
            "user": "ada",
            "password": "secret",
            "nested": {"password": "deep"}
        }));
        assert_eq!(masked["password"], json!("***"));
        assert_eq!(masked["nested"]["password"], json!("***"));
        assert_eq!(masked["user"], json!("ada"));
    }

    #[tokio::test]
    async fn timing_middleware_records_elapsed() {
        let mut chain = MiddlewareChain::new();
        chain.add(Arc::new(TimingMiddleware));

        let msg = test_message();
        let mut ctx = test_ctx();
        chain
            .run(&mut ctx, &msg, &Fixed(Ok(json!("ok"))))
            .await
            .unwrap();

        assert!(ctx.get("timing_ms").is_some());
    }
}
