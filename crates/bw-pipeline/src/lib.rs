//! BatchWorks Message Pipeline
//!
//! This crate provides the batch message-processing pipeline:
//! - Router: value-keyed dispatch with wildcard/default fallback and nested subrouters
//! - MiddlewareChain: ordered before/after/error hooks with guaranteed pairing
//! - IdempotencyGuard: duplicate-execution suppression over a pluggable store
//! - RetryPolicy + CircuitBreakerRegistry: transient retry with backoff, per-route fail-fast
//! - VisibilityTimeoutMonitor: deadline tracking with best-effort extension
//! - ConcurrencyController: semaphore admission, group ordering, blocking offload,
//!   resource pooling, and micro-batching
//! - BatchProcessor: end-to-end orchestration producing a partial-failure report

pub mod breaker;
pub mod concurrency;
pub mod error;
pub mod idempotency;
pub mod middleware;
pub mod processor;
pub mod retry;
pub mod router;
pub mod visibility;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState,
};
pub use concurrency::{
    BatchHandler, Batcher, BatcherConfig, ConcurrencyConfig, ConcurrencyController,
    PooledResource, ResourcePool, SlotPermit,
};
pub use error::{CircuitOpenError, PipelineError};
pub use idempotency::{
    ClaimOutcome, IdempotencyConfig, IdempotencyGuard, IdempotencyRecord, IdempotencyStore,
    KeySpec, MemoryIdempotencyStore, RecordStatus,
};
pub use middleware::{
    ErrorDisposition, Invoker, LoggingMiddleware, Middleware, MiddlewareChain,
    MiddlewareContext, TimingMiddleware,
};
pub use processor::{BatchProcessor, DeadLetterSink, PipelineConfig, ProcessorStats};
pub use retry::{ErrorClass, RetryConfig, RetryPolicy};
pub use router::{
    Handler, MatchKind, PayloadSchema, PayloadScope, Resolution, RouteError, Router,
    ScopedPayload, UnmatchedPolicy, ValidationPolicy,
};
pub use visibility::{
    VisibilityConfig, VisibilityExtender, VisibilityStats, VisibilityTimeoutMonitor,
};

pub type Result<T> = std::result::Result<T, PipelineError>;
