//! Scoring task handler.
//!
//! Produces the observation for one (result, row): resolves the metric
//! from the registry, gathers its required inputs, evaluates it, upserts
//! the observation row, bumps the result counters atomically, and flips
//! result/experiment status once every row of every metric has been
//! attempted.

use std::time::Instant;

use tracing::{info, warn};

use crate::error::MetricError;
use crate::metrics::{GenerationMetadata, MetricInput, MetricOutcome, MetricRegistry};
use crate::storage::{Answer, Dataset, ExperimentStatus, ObservationWrite, ResultStatus};

use super::task::ScoringTask;
use super::{RunnerContext, TaskError};

/// Executes one scoring task to completion.
///
/// Mirrors the generation handler's contract: every attempt leaves an
/// observation row and advances `num_try` exactly once.
pub async fn run_scoring_task(ctx: &RunnerContext, task: &ScoringTask) -> Result<(), TaskError> {
    let Some(experiment) = ctx.store.get_experiment(task.experiment_id).await? else {
        warn!(
            experiment_id = task.experiment_id,
            "Experiment not found, dropping scoring task"
        );
        return Ok(());
    };
    let Some(dataset) = ctx.store.get_dataset(experiment.dataset_id).await? else {
        warn!(
            experiment_id = experiment.id,
            dataset_id = experiment.dataset_id,
            "Dataset not found, dropping scoring task"
        );
        return Ok(());
    };
    let Some(result) = ctx
        .store
        .get_result(experiment.id, &task.metric_name)
        .await?
    else {
        warn!(
            experiment_id = experiment.id,
            metric = %task.metric_name,
            "No result tracks this metric, dropping scoring task"
        );
        return Ok(());
    };

    let answer = ctx.store.get_answer(experiment.id, task.row_index).await?;
    let metadata = metadata_from_answer(answer.as_ref());

    let started = Instant::now();
    let computed = evaluate(&ctx.metrics, task, &dataset, metadata);
    let execution_ms = started.elapsed().as_millis() as u64;

    let counters = match computed {
        Ok(outcome) => {
            let success = outcome.score.is_some();
            ctx.store
                .upsert_observation(
                    result.id,
                    task.row_index,
                    ObservationWrite::Success {
                        score: outcome.score,
                        observation: outcome.observation,
                        execution_ms,
                    },
                )
                .await?;
            ctx.store.bump_result_counters(result.id, success).await?
        }
        Err(e) => {
            let error_msg = format!("Scoring '{}' failed: {}", task.metric_name, e);
            warn!(
                experiment_id = experiment.id,
                metric = %task.metric_name,
                row_index = task.row_index,
                error = %e,
                "Scoring task failed"
            );
            let counters = ctx.store.bump_result_counters(result.id, false).await?;
            ctx.store
                .upsert_observation(
                    result.id,
                    task.row_index,
                    ObservationWrite::Failure { error_msg },
                )
                .await?;
            counters
        }
    };

    if counters.num_try >= dataset.size as u64 {
        ctx.store
            .advance_result_status(result.id, ResultStatus::Finished)
            .await?;
        info!(
            experiment_id = experiment.id,
            metric = %task.metric_name,
            num_try = counters.num_try,
            num_success = counters.num_success,
            "Metric finished"
        );

        // Re-read every result fresh: a worker-local view could miss a
        // sibling metric finishing concurrently.
        let results = ctx.store.list_results(experiment.id).await?;
        if !results.is_empty() && results.iter().all(|r| r.status == ResultStatus::Finished) {
            ctx.store
                .advance_experiment_status(experiment.id, ExperimentStatus::Finished)
                .await?;
            info!(experiment_id = experiment.id, "Experiment finished");
        }
    }

    Ok(())
}

/// Generation telemetry for metrics that consume it.
fn metadata_from_answer(answer: Option<&Answer>) -> GenerationMetadata {
    match answer {
        Some(answer) => GenerationMetadata {
            generation_ms: answer.execution_ms,
            prompt_tokens: answer.prompt_tokens,
            completion_tokens: answer.completion_tokens,
            tool_calls: answer.tool_call_count,
        },
        None => GenerationMetadata::default(),
    }
}

/// Resolves the metric and its required inputs, then evaluates it.
fn evaluate(
    registry: &MetricRegistry,
    task: &ScoringTask,
    dataset: &Dataset,
    metadata: GenerationMetadata,
) -> Result<MetricOutcome, MetricError> {
    let metric = registry
        .get(&task.metric_name)
        .ok_or_else(|| MetricError::NotFound(task.metric_name.clone()))?;

    let mut extras = serde_json::Map::new();
    for require in &metric.require {
        match require.as_str() {
            // output/output_true travel on the task; anything else comes
            // from the dataset row. A null required value is a hard
            // failure for this row, never a silent default.
            "output" => {
                if !task.output.as_deref().is_some_and(|s| !s.is_empty()) {
                    return Err(MetricError::MissingRequire("output".to_string()));
                }
            }
            "output_true" => {
                if !task.output_true.as_deref().is_some_and(|s| !s.is_empty()) {
                    return Err(MetricError::MissingRequire("output_true".to_string()));
                }
            }
            other => {
                let value = dataset
                    .column_value(task.row_index, other)
                    .cloned()
                    .ok_or_else(|| MetricError::MissingRequire(other.to_string()))?;
                extras.insert(other.to_string(), value);
            }
        }
    }

    let input = MetricInput {
        output: task.output.clone(),
        output_true: task.output_true.clone(),
        extras,
        metadata,
    };

    metric.evaluate(&input)
}
