//! Worker pool: competing consumers over the task queue.
//!
//! A fixed number of workers each run a loop: dequeue, route on the task
//! kind, execute the handler, acknowledge. A task failure is logged and
//! the loop continues; only fatal startup errors terminate a worker.
//!
//! Shutdown is cooperative via a broadcast channel; workers finish their
//! current task before stopping.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::queue::QueueError;
use super::task::{Envelope, EvalTask};
use super::{generate, score, RunnerContext};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Queue operation failed during startup.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing a task.
    pub active_workers: usize,
    /// Tasks that completed without a handler error.
    pub tasks_completed: u64,
    /// Tasks whose handler returned an error.
    pub tasks_failed: u64,
    /// Average task processing duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Total number of tasks processed.
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            tasks_completed: completed,
            tasks_failed: failed,
            average_task_duration: average_duration,
        }
    }
}

/// Worker pool that drains the task queue concurrently.
pub struct WorkerPool {
    ctx: Arc<RunnerContext>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool over a runner context.
    pub fn new(ctx: Arc<RunnerContext>) -> Self {
        // Buffer of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            ctx,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers.
    ///
    /// Recovers deliveries stranded in the processing list by a previous
    /// crash, then begins draining the queue.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let recovered = self.ctx.queue.recover().await?;
        if recovered > 0 {
            info!(recovered, "Recovered in-flight deliveries for redelivery");
        }

        for i in 0..self.ctx.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                ctx: Arc::clone(&self.ctx),
                shutdown_rx: self.shutdown_tx.subscribe(),
                stats: Arc::clone(&self.stats),
            };

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.ctx.config.num_workers,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let timeout = self.ctx.config.shutdown_timeout;
        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(()) => {
                self.is_running.store(false, Ordering::SeqCst);
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                self.is_running.store(false, Ordering::SeqCst);
                Err(PoolError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.ctx.config.num_workers)
    }

    /// Whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.ctx.config.num_workers
    }
}

/// A single worker processing tasks from the queue.
struct Worker {
    id: String,
    ctx: Arc<RunnerContext>,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Main worker loop: runs until a shutdown signal arrives.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.ctx.queue.dequeue(self.ctx.config.poll_interval).await {
                Ok(Some(envelope)) => {
                    self.process(envelope).await;
                }
                Ok(None) => {
                    // No task available; dequeue already waited poll_interval.
                    debug!(worker_id = %self.id, "No tasks available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue task");
                    tokio::time::sleep(self.ctx.config.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Processes one delivery and acknowledges it.
    ///
    /// Failures are recorded on the row by the handler, not retried here;
    /// the delivery is acknowledged either way. Redelivery only happens
    /// when a worker dies before the ack.
    async fn process(&self, envelope: Envelope) {
        let started = Instant::now();

        debug!(
            worker_id = %self.id,
            envelope_id = %envelope.id,
            kind = envelope.task.kind(),
            experiment_id = envelope.task.experiment_id(),
            row_index = envelope.task.row_index(),
            "Processing task"
        );

        self.stats.active_workers.fetch_add(1, Ordering::SeqCst);

        let result = match &envelope.task {
            EvalTask::Generation(task) => generate::run_generation_task(&self.ctx, task).await,
            EvalTask::Scoring(task) => score::run_scoring_task(&self.ctx, task).await,
        };

        self.stats.active_workers.fetch_sub(1, Ordering::SeqCst);
        let duration = started.elapsed();

        match result {
            Ok(()) => self.stats.record_completion(duration),
            Err(e) => {
                self.stats.record_failure(duration);
                error!(
                    worker_id = %self.id,
                    envelope_id = %envelope.id,
                    error = %e,
                    "Task handler failed"
                );
            }
        }

        if let Err(e) = self.ctx.queue.ack(envelope.id).await {
            error!(
                worker_id = %self.id,
                envelope_id = %envelope.id,
                error = %e,
                "Failed to acknowledge delivery"
            );
        }
    }
}
