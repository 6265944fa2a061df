//! Concurrency control for handler execution.
//!
//! A counting semaphore is the sole admission gate for parallelism. On top
//! of it: per-group mutual exclusion for ordered processing, a bounded
//! offload path for blocking work, a shared resource pool with FIFO
//! backpressure, and an optional micro-batcher that accumulates messages
//! and invokes a batch-capable handler once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use bw_common::{HandlerError, Message};

use crate::error::PipelineError;

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// Maximum concurrently executing handler invocations.
    pub max_concurrent: usize,
    /// Slots for offloaded blocking/CPU-bound work.
    pub worker_pool_size: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            worker_pool_size: 4,
        }
    }
}

/// An admission slot. Dropping it releases the slot.
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicU32>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ConcurrencyController {
    config: ConcurrencyConfig,
    semaphore: Arc<Semaphore>,
    blocking_slots: Arc<Semaphore>,
    group_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    active: Arc<AtomicU32>,
    peak: AtomicU32,
}

impl ConcurrencyController {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            blocking_slots: Arc::new(Semaphore::new(config.worker_pool_size)),
            group_locks: DashMap::new(),
            active: Arc::new(AtomicU32::new(0)),
            peak: AtomicU32::new(0),
            config,
        }
    }

    /// Wait for an execution slot.
    pub async fn acquire(&self) -> Result<SlotPermit, PipelineError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::ShutdownInProgress)?;

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);

        Ok(SlotPermit {
            _permit: permit,
            active: self.active.clone(),
        })
    }

    /// Acquire the mutual-exclusion lock for a group key. Messages sharing a
    /// group process sequentially; distinct groups proceed in parallel.
    pub async fn lock_group(&self, group: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .group_locks
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop group locks nobody currently holds or waits on.
    pub fn prune_group_locks(&self) {
        self.group_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Run blocking or CPU-bound work on the secondary pool, keeping the
    /// async scheduler free. Bounded by `worker_pool_size`.
    pub async fn offload<F, T>(&self, work: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _slot = self
            .blocking_slots
            .acquire()
            .await
            .map_err(|_| PipelineError::ShutdownInProgress)?;

        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| PipelineError::Concurrency(format!("offloaded task failed: {e}")))
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    pub fn active_workers(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest concurrently-active count observed since construction.
    pub fn peak_workers(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn group_count(&self) -> usize {
        self.group_locks.len()
    }
}

// ============================================================================
// Resource Pool
// ============================================================================

/// Fixed set of reusable resources with FIFO backpressure.
///
/// `acquire` waits when the pool is exhausted; the returned guard gives the
/// resource back on drop, on every exit path.
pub struct ResourcePool<T: Send> {
    items: Mutex<VecDeque<T>>,
    available: Semaphore,
}

impl<T: Send> ResourcePool<T> {
    pub fn new(items: Vec<T>) -> Arc<Self> {
        let available = Semaphore::new(items.len());
        Arc::new(Self {
            items: Mutex::new(items.into()),
            available,
        })
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<PooledResource<T>, PipelineError> {
        let permit = self
            .available
            .acquire()
            .await
            .map_err(|_| PipelineError::ShutdownInProgress)?;
        // The permit guarantees an item is present.
        permit.forget();
        let item = self.items.lock().pop_front();
        match item {
            Some(item) => Ok(PooledResource {
                item: Some(item),
                pool: self.clone(),
            }),
            None => Err(PipelineError::Concurrency(
                "resource pool invariant violated: permit without item".to_string(),
            )),
        }
    }

    pub fn idle(&self) -> usize {
        self.items.lock().len()
    }
}

pub struct PooledResource<T: Send> {
    item: Option<T>,
    pool: Arc<ResourcePool<T>>,
}

impl<T: Send> std::ops::Deref for PooledResource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("resource present until drop")
    }
}

impl<T: Send> std::ops::DerefMut for PooledResource<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("resource present until drop")
    }
}

impl<T: Send> Drop for PooledResource<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.items.lock().push_back(item);
        }
        self.pool.available.add_permits(1);
    }
}

// ============================================================================
// Micro-Batching
// ============================================================================

/// Handler invoked once per accumulated batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, messages: Vec<Message>) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Submission queue depth before `submit` applies backpressure.
    pub queue_capacity: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout: Duration::from_secs(5),
            queue_capacity: 256,
        }
    }
}

/// Accumulates messages until `batch_size` or `batch_timeout`, then invokes
/// the batch handler once.
pub struct Batcher {
    tx: mpsc::Sender<Message>,
    worker: JoinHandle<()>,
}

impl Batcher {
    pub fn spawn(config: BatcherConfig, handler: Arc<dyn BatchHandler>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let worker = tokio::spawn(Self::run(config, rx, handler));
        Self { tx, worker }
    }

    pub async fn submit(&self, message: Message) -> Result<(), PipelineError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| PipelineError::Batcher("batcher is shut down".to_string()))
    }

    /// Flush any buffered messages and stop the worker.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(error) = self.worker.await {
            error!(error = %error, "Batcher worker terminated abnormally");
        }
    }

    async fn run(
        config: BatcherConfig,
        mut rx: mpsc::Receiver<Message>,
        handler: Arc<dyn BatchHandler>,
    ) {
        let mut buffer: Vec<Message> = Vec::with_capacity(config.batch_size);

        loop {
            let message = if buffer.is_empty() {
                match rx.recv().await {
                    Some(message) => message,
                    None => break,
                }
            } else {
                match tokio::time::timeout(config.batch_timeout, rx.recv()).await {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(_) => {
                        Self::flush(&handler, &mut buffer).await;
                        continue;
                    }
                }
            };

            buffer.push(message);
            if buffer.len() >= config.batch_size {
                Self::flush(&handler, &mut buffer).await;
            }
        }

        Self::flush(&handler, &mut buffer).await;
        debug!("Batcher worker exited");
    }

    async fn flush(handler: &Arc<dyn BatchHandler>, buffer: &mut Vec<Message>) {
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(buffer);
        let size = batch.len();
        if let Err(error) = handler.handle_batch(batch).await {
            warn!(batch_size = size, error = %error, "Batch handler failed");
        }
    }
}
