//! Task definitions for the evaluation runner.
//!
//! The queue carries exactly two task shapes, decoded at the queue
//! boundary into a tagged union and dispatched by pattern match. Each
//! delivery travels in an [`Envelope`] that gives it an identity for
//! acknowledgement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_true() -> bool {
    true
}

/// Generate an answer for one dataset row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationTask {
    /// The owning experiment.
    pub experiment_id: i64,
    /// The model to generate with.
    pub model_id: i64,
    /// Zero-based dataset row index.
    pub row_index: usize,
    /// The row's query column.
    pub query: String,
    /// Whether crossing the completion threshold triggers scoring dispatch.
    #[serde(default = "default_true")]
    pub follow_scoring: bool,
}

/// Score one row's output with a metric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringTask {
    /// The owning experiment.
    pub experiment_id: i64,
    /// Zero-based dataset row index.
    pub row_index: usize,
    /// Registry name of the metric to apply.
    pub metric_name: String,
    /// The output under evaluation; `None` when the row's generation failed.
    pub output: Option<String>,
    /// Ground-truth output, when the dataset has one.
    #[serde(default)]
    pub output_true: Option<String>,
}

/// A task, tagged by kind on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvalTask {
    /// Generate an answer for a row.
    Generation(GenerationTask),
    /// Score a row's output with a metric.
    Scoring(ScoringTask),
}

impl EvalTask {
    /// The experiment this task belongs to.
    pub fn experiment_id(&self) -> i64 {
        match self {
            EvalTask::Generation(t) => t.experiment_id,
            EvalTask::Scoring(t) => t.experiment_id,
        }
    }

    /// The dataset row this task addresses.
    pub fn row_index(&self) -> usize {
        match self {
            EvalTask::Generation(t) => t.row_index,
            EvalTask::Scoring(t) => t.row_index,
        }
    }

    /// Short kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EvalTask::Generation(_) => "generation",
            EvalTask::Scoring(_) => "scoring",
        }
    }
}

/// A queued task delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Delivery identity, used for acknowledgement.
    pub id: Uuid,
    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,
    /// The task itself.
    pub task: EvalTask,
}

impl Envelope {
    /// Wraps a task in a fresh envelope.
    pub fn new(task: EvalTask) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            task,
        }
    }
}
