//! The distributed evaluation runner.
//!
//! This module is the engine: it turns experiments into row tasks,
//! transports them at-least-once over the queue, executes them on a pool
//! of competing consumers, and advances completion state as they drain.
//!
//! ```text
//!                    ┌──────────────┐
//!                    │  Dispatcher  │◀─── dispatch(experiment_id)
//!                    └──────┬───────┘
//!                           │ GenerationTask | ScoringTask
//!                    ┌──────▼───────┐
//!                    │  Task Queue  │  (at-least-once)
//!                    └──────┬───────┘
//!         ┌─────────────────┼─────────────────┐
//!         ▼                 ▼                 ▼
//!    ┌─────────┐       ┌─────────┐       ┌─────────┐
//!    │ Worker 1│       │ Worker 2│       │ Worker N│
//!    └────┬────┘       └────┬────┘       └────┬────┘
//!         └──── answers / observations ───────┘
//!                   + atomic counters
//! ```
//!
//! When the last generation task of an experiment completes, the handler
//! re-invokes the dispatcher to emit scoring tasks; when the last scoring
//! task of every metric completes, the experiment finishes.

pub mod dispatcher;
pub mod generate;
pub mod queue;
pub mod score;
pub mod task;
pub mod worker;

use std::sync::Arc;

use thiserror::Error;

use crate::config::RunnerConfig;
use crate::llm::GenerationProvider;
use crate::metrics::MetricRegistry;
use crate::storage::{EvalStore, StoreError};
use crate::tools::ToolBridge;

pub use dispatcher::{DispatchError, Dispatcher};
pub use queue::{QueueError, RedisTaskQueue, TaskQueue};
pub use task::{Envelope, EvalTask, GenerationTask, ScoringTask};
pub use worker::{PoolError, PoolStats, WorkerPool};

/// Errors a task handler can surface to its worker.
///
/// Per-row evaluation failures never appear here; they are recorded on
/// the answer/observation rows. Only infrastructure failures propagate.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Follow-up dispatch failed.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Everything a worker needs to execute tasks.
pub struct RunnerContext {
    /// The persistent store.
    pub store: Arc<dyn EvalStore>,
    /// The task queue.
    pub queue: Arc<dyn TaskQueue>,
    /// The generation provider.
    pub provider: Arc<dyn GenerationProvider>,
    /// The tool bridge, when one is configured.
    pub bridge: Option<Arc<dyn ToolBridge>>,
    /// The metric registry.
    pub metrics: Arc<MetricRegistry>,
    /// Runner configuration.
    pub config: RunnerConfig,
}

impl RunnerContext {
    /// A dispatcher over this context's store and queue.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.store), Arc::clone(&self.queue))
    }
}
