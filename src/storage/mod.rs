//! Persistent storage for experiments, answers and observations.
//!
//! The engine talks to storage through the [`EvalStore`] trait; the
//! PostgreSQL implementation lives in [`database`]. Counter mutations are
//! atomic update-and-return operations so concurrent workers never lose an
//! increment, and answer/observation writes are upserts keyed by their
//! natural key so redelivered tasks overwrite rather than duplicate.

pub mod database;
pub mod migrations;
pub mod records;
pub mod schema;

use async_trait::async_trait;
use thiserror::Error;

pub use database::Database;
pub use records::{
    Answer, AnswerWrite, Counters, Dataset, DatasetRow, Experiment, ExperimentStatus,
    MetricResult, Model, Observation, ObservationWrite, ResultStatus,
};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the backend failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A persisted record failed validation on read.
    #[error("Invalid record: {0}")]
    Invalid(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] migrations::MigrationError),
}

/// The persistent-store contract the engine runs against.
///
/// Production uses [`Database`] (PostgreSQL); tests drive the engine
/// against an in-memory implementation.
#[async_trait]
pub trait EvalStore: Send + Sync {
    /// Fetches a dataset with its rows.
    async fn get_dataset(&self, id: i64) -> Result<Option<Dataset>, StoreError>;

    /// Fetches a model.
    async fn get_model(&self, id: i64) -> Result<Option<Model>, StoreError>;

    /// Fetches an experiment.
    async fn get_experiment(&self, id: i64) -> Result<Option<Experiment>, StoreError>;

    /// Fetches the result tracking a metric within an experiment.
    async fn get_result(
        &self,
        experiment_id: i64,
        metric_name: &str,
    ) -> Result<Option<MetricResult>, StoreError>;

    /// Fetches all results of an experiment, fresh from the backend.
    async fn list_results(&self, experiment_id: i64) -> Result<Vec<MetricResult>, StoreError>;

    /// Fetches the answer for a row, if one was ever attempted.
    async fn get_answer(
        &self,
        experiment_id: i64,
        row_index: usize,
    ) -> Result<Option<Answer>, StoreError>;

    /// Fetches the observation for a row, if one was ever attempted.
    async fn get_observation(
        &self,
        result_id: i64,
        row_index: usize,
    ) -> Result<Option<Observation>, StoreError>;

    /// Upserts the answer row keyed by (experiment, row index).
    async fn upsert_answer(
        &self,
        experiment_id: i64,
        row_index: usize,
        write: AnswerWrite,
    ) -> Result<(), StoreError>;

    /// Upserts the observation row keyed by (result, row index).
    async fn upsert_observation(
        &self,
        result_id: i64,
        row_index: usize,
        write: ObservationWrite,
    ) -> Result<(), StoreError>;

    /// Clears a failed answer's error before re-dispatching its row.
    async fn clear_answer_error(
        &self,
        experiment_id: i64,
        row_index: usize,
    ) -> Result<(), StoreError>;

    /// Clears a failed observation's error before re-dispatching its row.
    async fn clear_observation_error(
        &self,
        result_id: i64,
        row_index: usize,
    ) -> Result<(), StoreError>;

    /// Atomically increments an experiment's counters and returns the new
    /// values. `num_success` advances only when `success` is set.
    async fn bump_experiment_counters(
        &self,
        id: i64,
        success: bool,
    ) -> Result<Counters, StoreError>;

    /// Atomically increments a result's counters and returns the new values.
    async fn bump_result_counters(&self, id: i64, success: bool)
        -> Result<Counters, StoreError>;

    /// Recounts an experiment's counters from its answer rows and resets
    /// both to the success count, so re-attempted rows are counted again.
    async fn reconcile_experiment_counters(&self, id: i64) -> Result<Counters, StoreError>;

    /// Recounts a result's counters from its observation rows.
    async fn reconcile_result_counters(&self, id: i64) -> Result<Counters, StoreError>;

    /// Advances an experiment's status; regressions are silent no-ops.
    async fn advance_experiment_status(
        &self,
        id: i64,
        to: ExperimentStatus,
    ) -> Result<(), StoreError>;

    /// Advances a result's status; regressions are silent no-ops.
    async fn advance_result_status(&self, id: i64, to: ResultStatus) -> Result<(), StoreError>;
}
