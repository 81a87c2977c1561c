//! Task dispatcher: turns an experiment into a stream of row tasks.
//!
//! `dispatch` is the fire-and-forget trigger the API layer calls; it picks
//! the generation or scoring branch from the experiment's shape. The
//! scoring branch is also invoked automatically by generation handlers
//! once the last answer lands.
//!
//! Dispatch is safe to call twice: rows that already succeeded are
//! skipped, counters are reconciled from what is actually persisted, and
//! duplicate tasks are absorbed downstream by upserts.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Dataset, EvalStore, Experiment, ExperimentStatus, ResultStatus, StoreError};

use super::queue::{QueueError, TaskQueue};
use super::task::{Envelope, EvalTask, GenerationTask, ScoringTask};

/// Errors that can occur during dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The experiment does not exist.
    #[error("Experiment {0} not found")]
    ExperimentNotFound(i64),

    /// The experiment's dataset does not exist.
    #[error("Dataset {0} not found")]
    DatasetNotFound(i64),

    /// Generation was requested for an experiment without a model.
    #[error("Experiment {0} has no model attached")]
    MissingModel(i64),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Converts experiments into queued row tasks.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn EvalStore>,
    queue: Arc<dyn TaskQueue>,
}

impl Dispatcher {
    /// Creates a new dispatcher.
    pub fn new(store: Arc<dyn EvalStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Dispatches an experiment.
    ///
    /// Emits generation tasks when the dataset has no pre-existing output
    /// column and a model is attached; scoring tasks otherwise.
    pub async fn dispatch(&self, experiment_id: i64) -> Result<(), DispatchError> {
        let (experiment, dataset) = self.load(experiment_id).await?;

        if !dataset.has_output && experiment.model_id.is_some() {
            self.dispatch_generation(&experiment, &dataset).await
        } else {
            self.dispatch_scoring_inner(&experiment, &dataset).await
        }
    }

    /// Dispatches the scoring phase of an experiment.
    ///
    /// Called by generation handlers when the last answer lands, and
    /// usable directly to re-run metrics.
    pub async fn dispatch_scoring(&self, experiment_id: i64) -> Result<(), DispatchError> {
        let (experiment, dataset) = self.load(experiment_id).await?;
        self.dispatch_scoring_inner(&experiment, &dataset).await
    }

    async fn load(&self, experiment_id: i64) -> Result<(Experiment, Dataset), DispatchError> {
        let experiment = self
            .store
            .get_experiment(experiment_id)
            .await?
            .ok_or(DispatchError::ExperimentNotFound(experiment_id))?;

        let dataset = self
            .store
            .get_dataset(experiment.dataset_id)
            .await?
            .ok_or(DispatchError::DatasetNotFound(experiment.dataset_id))?;

        Ok((experiment, dataset))
    }

    async fn dispatch_generation(
        &self,
        experiment: &Experiment,
        dataset: &Dataset,
    ) -> Result<(), DispatchError> {
        let model_id = experiment
            .model_id
            .ok_or(DispatchError::MissingModel(experiment.id))?;

        self.store
            .advance_experiment_status(experiment.id, ExperimentStatus::RunningGeneration)
            .await?;

        // Align counters with what is actually persisted; rows about to be
        // re-attempted are counted again when their task runs.
        self.store
            .reconcile_experiment_counters(experiment.id)
            .await?;

        let mut envelopes = Vec::with_capacity(dataset.size);
        for row_index in 0..dataset.size {
            if let Some(answer) = self.store.get_answer(experiment.id, row_index).await? {
                if answer.is_success() {
                    debug!(
                        experiment_id = experiment.id,
                        row_index, "Row already answered, skipping"
                    );
                    continue;
                }
                self.store
                    .clear_answer_error(experiment.id, row_index)
                    .await?;
            }

            envelopes.push(Envelope::new(EvalTask::Generation(GenerationTask {
                experiment_id: experiment.id,
                model_id,
                row_index,
                query: dataset.column_str(row_index, "query").unwrap_or_default(),
                follow_scoring: true,
            })));
        }

        let count = envelopes.len();
        self.queue.enqueue_batch(envelopes).await?;

        info!(
            experiment_id = experiment.id,
            tasks = count,
            dataset_size = dataset.size,
            "Dispatched generation tasks"
        );

        Ok(())
    }

    async fn dispatch_scoring_inner(
        &self,
        experiment: &Experiment,
        dataset: &Dataset,
    ) -> Result<(), DispatchError> {
        self.store
            .advance_experiment_status(experiment.id, ExperimentStatus::RunningScoring)
            .await?;

        // A result already marked running belongs to a concurrent dispatch;
        // skipping it here keeps the duplicate-task volume down. A lost race
        // only produces duplicates, which the observation upsert absorbs.
        let mut active = Vec::new();
        for result in self.store.list_results(experiment.id).await? {
            if result.status == ResultStatus::Running {
                info!(
                    experiment_id = experiment.id,
                    metric = %result.metric_name,
                    "Metric already running, skipping"
                );
                continue;
            }
            self.store
                .advance_result_status(result.id, ResultStatus::Running)
                .await?;
            self.store.reconcile_result_counters(result.id).await?;
            active.push(result);
        }

        let mut envelopes = Vec::new();
        for row_index in 0..dataset.size {
            let answer = self.store.get_answer(experiment.id, row_index).await?;
            // Prefer the generated answer; datasets that ship outputs score
            // their own column.
            let output = answer
                .as_ref()
                .and_then(|a| a.answer.clone())
                .or_else(|| dataset.column_str(row_index, "output"));
            let output_true = dataset.column_str(row_index, "output_true");

            for result in &active {
                if let Some(obs) = self.store.get_observation(result.id, row_index).await? {
                    if obs.is_success() {
                        continue;
                    }
                    self.store
                        .clear_observation_error(result.id, row_index)
                        .await?;
                }

                envelopes.push(Envelope::new(EvalTask::Scoring(ScoringTask {
                    experiment_id: experiment.id,
                    row_index,
                    metric_name: result.metric_name.clone(),
                    output: output.clone(),
                    output_true: output_true.clone(),
                })));
            }
        }

        let count = envelopes.len();
        self.queue.enqueue_batch(envelopes).await?;

        info!(
            experiment_id = experiment.id,
            tasks = count,
            metrics = active.len(),
            dataset_size = dataset.size,
            "Dispatched scoring tasks"
        );

        Ok(())
    }
}
