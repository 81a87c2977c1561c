//! Domain records and lifecycle status machines.
//!
//! These are the rows the engine reads and writes: datasets, models,
//! experiments, per-metric results, per-row answers and observations.
//! Status enums encode the forward-only lifecycle used by the guarded
//! store transitions.

use serde::{Deserialize, Serialize};

use crate::llm::{ModelEndpoint, SamplingParams, StepTrace};

/// One dataset row: a JSON object keyed by column name.
pub type DatasetRow = serde_json::Map<String, serde_json::Value>;

/// Lifecycle status of an experiment.
///
/// ```text
/// pending → running-generation → running-scoring → finished
/// pending → running-scoring → finished     (outputs already supplied)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperimentStatus {
    Pending,
    RunningGeneration,
    RunningScoring,
    Finished,
}

impl ExperimentStatus {
    /// Stable string form, used in the database and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Pending => "pending",
            ExperimentStatus::RunningGeneration => "running-generation",
            ExperimentStatus::RunningScoring => "running-scoring",
            ExperimentStatus::Finished => "finished",
        }
    }

    /// Parses the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExperimentStatus::Pending),
            "running-generation" => Some(ExperimentStatus::RunningGeneration),
            "running-scoring" => Some(ExperimentStatus::RunningScoring),
            "finished" => Some(ExperimentStatus::Finished),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ExperimentStatus::Pending => 0,
            ExperimentStatus::RunningGeneration => 1,
            ExperimentStatus::RunningScoring => 2,
            ExperimentStatus::Finished => 3,
        }
    }

    /// Whether moving to `target` is a forward transition.
    ///
    /// Guarded status updates are no-ops otherwise, so a finished run can
    /// never regress under concurrent workers; re-opening is an external
    /// reset to `Pending`, not a transition.
    pub fn can_advance_to(&self, target: ExperimentStatus) -> bool {
        target.rank() > self.rank()
    }

    /// All statuses, in lifecycle order.
    pub fn all() -> [ExperimentStatus; 4] {
        [
            ExperimentStatus::Pending,
            ExperimentStatus::RunningGeneration,
            ExperimentStatus::RunningScoring,
            ExperimentStatus::Finished,
        ]
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a per-metric result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultStatus {
    Pending,
    Running,
    Finished,
}

impl ResultStatus {
    /// Stable string form, used in the database and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pending => "pending",
            ResultStatus::Running => "running",
            ResultStatus::Finished => "finished",
        }
    }

    /// Parses the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ResultStatus::Pending),
            "running" => Some(ResultStatus::Running),
            "finished" => Some(ResultStatus::Finished),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ResultStatus::Pending => 0,
            ResultStatus::Running => 1,
            ResultStatus::Finished => 2,
        }
    }

    /// Whether moving to `target` is a forward transition.
    pub fn can_advance_to(&self, target: ResultStatus) -> bool {
        target.rank() > self.rank()
    }

    /// All statuses, in lifecycle order.
    pub fn all() -> [ResultStatus; 3] {
        [
            ResultStatus::Pending,
            ResultStatus::Running,
            ResultStatus::Finished,
        ]
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable row table with a fixed schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i64,
    pub name: String,
    /// The rows, in index order.
    pub rows: Vec<DatasetRow>,
    /// Row count, fixed at creation.
    pub size: usize,
    /// Whether any row has a non-null `query` column.
    pub has_query: bool,
    /// Whether any row has a non-null `output` column.
    pub has_output: bool,
    /// Whether any row has a non-null `output_true` column.
    pub has_output_true: bool,
}

impl Dataset {
    /// Builds a dataset, computing size and column flags once.
    pub fn new(id: i64, name: impl Into<String>, rows: Vec<DatasetRow>) -> Self {
        let has_column = |key: &str| {
            rows.iter()
                .any(|row| row.get(key).is_some_and(|v| !v.is_null()))
        };

        let has_query = has_column("query");
        let has_output = has_column("output");
        let has_output_true = has_column("output_true");
        let size = rows.len();

        Self {
            id,
            name: name.into(),
            rows,
            size,
            has_query,
            has_output,
            has_output_true,
        }
    }

    /// The row at a zero-based index.
    pub fn row(&self, index: usize) -> Option<&DatasetRow> {
        self.rows.get(index)
    }

    /// A column's raw value at a row, `None` when absent or null.
    pub fn column_value(&self, index: usize, key: &str) -> Option<&serde_json::Value> {
        self.row(index)
            .and_then(|row| row.get(key))
            .filter(|v| !v.is_null())
    }

    /// A text column's value at a row.
    pub fn column_str(&self, index: usize, key: &str) -> Option<String> {
        self.column_value(index, key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// A model an experiment generates answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    /// Prepended to every query, separated by a blank line.
    pub prelude_prompt: Option<String>,
    #[serde(default)]
    pub sampling_params: SamplingParams,
    /// Names of bridge tools this model may call; empty disables the loop.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl Model {
    /// The endpoint generation requests for this model go to.
    pub fn endpoint(&self) -> ModelEndpoint {
        ModelEndpoint::new(self.base_url.clone(), self.api_key.clone())
    }
}

/// Completion counters of an experiment or result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Attempts, one per task delivery processed.
    pub num_try: u64,
    /// Successful attempts; never exceeds `num_try`.
    pub num_success: u64,
}

/// One evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    pub name: String,
    pub dataset_id: i64,
    /// Absent when the dataset already supplies outputs.
    pub model_id: Option<i64>,
    pub status: ExperimentStatus,
    /// Generation attempt counters across rows.
    pub counters: Counters,
}

/// Per-metric tracking record within an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricResult {
    pub id: i64,
    pub experiment_id: i64,
    pub metric_name: String,
    pub status: ResultStatus,
    /// Scoring attempt counters across rows, scoped to this metric.
    pub counters: Counters,
}

/// Generation outcome for one (experiment, row).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Answer {
    pub experiment_id: i64,
    pub row_index: usize,
    pub answer: Option<String>,
    pub error_msg: Option<String>,
    pub execution_ms: Option<u64>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub tool_call_count: Option<u32>,
    #[serde(default)]
    pub tool_steps: StepTrace,
}

impl Answer {
    /// Whether this row needs no re-generation on re-dispatch.
    ///
    /// Empty answers do not count; they are re-attempted like failures.
    pub fn is_success(&self) -> bool {
        self.answer.as_deref().is_some_and(|s| !s.is_empty()) && self.error_msg.is_none()
    }
}

/// Scoring outcome for one (result, row).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Observation {
    pub result_id: i64,
    pub row_index: usize,
    pub score: Option<f64>,
    pub observation: Option<String>,
    pub error_msg: Option<String>,
    pub execution_ms: Option<u64>,
}

impl Observation {
    /// Whether this row needs no re-scoring on re-dispatch.
    pub fn is_success(&self) -> bool {
        self.score.is_some() && self.error_msg.is_none()
    }
}

/// What a generation task writes to its answer row.
#[derive(Debug, Clone)]
pub enum AnswerWrite {
    /// The provider returned; the answer may still be empty.
    Success {
        answer: Option<String>,
        execution_ms: u64,
        prompt_tokens: u32,
        completion_tokens: u32,
        tool_steps: StepTrace,
    },
    /// Generation failed; only the error is recorded, prior fields stay.
    Failure { error_msg: String },
}

/// What a scoring task writes to its observation row.
#[derive(Debug, Clone)]
pub enum ObservationWrite {
    /// The metric ran; a `None` score is a valid scoreless outcome.
    Success {
        score: Option<f64>,
        observation: Option<String>,
        execution_ms: u64,
    },
    /// Scoring failed; only the error is recorded, prior fields stay.
    Failure { error_msg: String },
}
