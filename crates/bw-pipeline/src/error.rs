use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Idempotency store error: {0}")]
    Store(String),

    #[error("Concurrency error: {0}")]
    Concurrency(String),

    #[error("Batcher error: {0}")]
    Batcher(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

/// Rejection issued while a route's circuit is open.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit open for route '{route}', retry after {retry_after:?}")]
pub struct CircuitOpenError {
    pub route: String,
    pub retry_after: Duration,
}

impl From<bw_common::BatchWorksError> for PipelineError {
    fn from(err: bw_common::BatchWorksError) -> Self {
        match err {
            bw_common::BatchWorksError::Store(msg) => PipelineError::Store(msg),
            bw_common::BatchWorksError::ShutdownInProgress => PipelineError::ShutdownInProgress,
            other => PipelineError::Concurrency(other.to_string()),
        }
    }
}
