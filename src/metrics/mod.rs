//! Metric registry for scoring answers.
//!
//! Metrics are pure functions: given an output, an optional ground truth,
//! extra dataset columns and generation metadata, they return a score and
//! an optional observation text. The registry is populated once at process
//! start from the builtin list; the scoring path only ever uses
//! [`MetricRegistry::get`].

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::MetricError;

/// Generation telemetry made available to metrics that consume it.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationMetadata {
    /// Wall-clock generation time in milliseconds.
    pub generation_ms: Option<u64>,
    /// Prompt token count.
    pub prompt_tokens: Option<u32>,
    /// Completion token count.
    pub completion_tokens: Option<u32>,
    /// Number of tool calls made during generation.
    pub tool_calls: Option<u32>,
}

/// Input handed to a metric function.
#[derive(Debug, Clone, Default)]
pub struct MetricInput {
    /// The answer under evaluation.
    pub output: Option<String>,
    /// Ground-truth answer, when the dataset provides one.
    pub output_true: Option<String>,
    /// Extra dataset columns named in the metric's require list.
    pub extras: serde_json::Map<String, serde_json::Value>,
    /// Generation telemetry.
    pub metadata: GenerationMetadata,
}

/// Outcome of a metric evaluation.
///
/// A `None` score is a valid outcome (e.g. telemetry metrics over a row
/// whose generation never produced usage data); it simply does not count
/// as a success.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricOutcome {
    /// The computed score.
    pub score: Option<f64>,
    /// Optional free-form explanation.
    pub observation: Option<String>,
}

impl MetricOutcome {
    /// Outcome with a score and no observation.
    pub fn score(score: f64) -> Self {
        Self {
            score: Some(score),
            observation: None,
        }
    }

    /// Outcome with a score and an observation text.
    pub fn with_observation(score: f64, observation: impl Into<String>) -> Self {
        Self {
            score: Some(score),
            observation: Some(observation.into()),
        }
    }

    /// Outcome without a score.
    pub fn empty() -> Self {
        Self {
            score: None,
            observation: None,
        }
    }
}

/// A metric's scoring function.
pub type MetricFn =
    Arc<dyn Fn(&MetricInput) -> Result<MetricOutcome, MetricError> + Send + Sync>;

/// A registered metric: its input contract and its function.
#[derive(Clone)]
pub struct MetricDef {
    /// Registry name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Input names this metric requires to be non-null.
    pub require: Vec<String>,
    func: MetricFn,
}

impl MetricDef {
    /// Evaluates the metric on the given input.
    pub fn evaluate(&self, input: &MetricInput) -> Result<MetricOutcome, MetricError> {
        (self.func)(input)
    }
}

impl std::fmt::Debug for MetricDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricDef")
            .field("name", &self.name)
            .field("require", &self.require)
            .finish()
    }
}

/// Name → metric mapping, populated at process start.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    metrics: HashMap<String, MetricDef>,
}

impl MetricRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry populated with the builtin metrics.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Registers a metric, replacing any previous definition of the name.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        require: &[&str],
        func: F,
    ) where
        F: Fn(&MetricInput) -> Result<MetricOutcome, MetricError> + Send + Sync + 'static,
    {
        let name = name.into();
        self.metrics.insert(
            name.clone(),
            MetricDef {
                name,
                description: description.into(),
                require: require.iter().map(|s| s.to_string()).collect(),
                func: Arc::new(func),
            },
        );
    }

    /// Looks up a metric by name.
    pub fn get(&self, name: &str) -> Option<&MetricDef> {
        self.metrics.get(name)
    }

    /// Names of all registered metrics, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.metrics.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered metrics.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
