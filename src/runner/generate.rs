//! Generation task handler.
//!
//! Produces the answer for one (experiment, row): builds the message list,
//! runs the multi-step tool loop, upserts the answer row, bumps the
//! experiment counters atomically, and hands the experiment to the scoring
//! dispatcher once the last row has been attempted.

use std::time::Instant;

use tracing::{info, warn};

use crate::error::LlmError;
use crate::llm::{ChatMessage, ChatRequest, MultiStepGenerator, StepTrace};
use crate::storage::{AnswerWrite, Model};

use super::task::GenerationTask;
use super::{RunnerContext, TaskError};

/// Executes one generation task to completion.
///
/// Every attempt leaves an answer row behind (success or recorded
/// failure) and advances `num_try` exactly once; only infrastructure
/// errors propagate to the worker.
pub async fn run_generation_task(
    ctx: &RunnerContext,
    task: &GenerationTask,
) -> Result<(), TaskError> {
    let Some(experiment) = ctx.store.get_experiment(task.experiment_id).await? else {
        warn!(
            experiment_id = task.experiment_id,
            "Experiment not found, dropping generation task"
        );
        return Ok(());
    };
    let Some(dataset) = ctx.store.get_dataset(experiment.dataset_id).await? else {
        warn!(
            experiment_id = experiment.id,
            dataset_id = experiment.dataset_id,
            "Dataset not found, dropping generation task"
        );
        return Ok(());
    };

    let model = ctx.store.get_model(task.model_id).await?;

    let started = Instant::now();
    let (success, error_msg) = match model {
        Some(model) => match generate(ctx, task, &model).await {
            Ok((answer, usage, steps)) => {
                let success = answer.as_deref().is_some_and(|s| !s.is_empty());
                ctx.store
                    .upsert_answer(
                        experiment.id,
                        task.row_index,
                        AnswerWrite::Success {
                            answer,
                            execution_ms: started.elapsed().as_millis() as u64,
                            prompt_tokens: usage.0,
                            completion_tokens: usage.1,
                            tool_steps: steps,
                        },
                    )
                    .await?;
                (success, None)
            }
            Err(e) => (false, Some(format!("Generation failed: {}", e))),
        },
        // A missing model is a configuration failure for this row; the
        // counters still advance so completion detection converges.
        None => (false, Some(format!("Model {} not found", task.model_id))),
    };

    let counters = ctx
        .store
        .bump_experiment_counters(experiment.id, success)
        .await?;

    if let Some(error_msg) = error_msg {
        warn!(
            experiment_id = experiment.id,
            row_index = task.row_index,
            error = %error_msg,
            "Generation task failed"
        );
        ctx.store
            .upsert_answer(
                experiment.id,
                task.row_index,
                AnswerWrite::Failure { error_msg },
            )
            .await?;
    }

    // Several workers may cross the threshold at once; the scoring
    // dispatch is idempotent so each crossing is safe.
    if counters.num_try >= dataset.size as u64 && task.follow_scoring {
        info!(
            experiment_id = experiment.id,
            num_try = counters.num_try,
            num_success = counters.num_success,
            "All generation tasks attempted, dispatching scoring"
        );
        ctx.dispatcher().dispatch_scoring(experiment.id).await?;
    }

    Ok(())
}

/// Runs the provider call for one row.
///
/// Returns the answer text, (prompt, completion) token counts and the
/// tool step trace.
async fn generate(
    ctx: &RunnerContext,
    task: &GenerationTask,
    model: &Model,
) -> Result<(Option<String>, (u32, u32), StepTrace), LlmError> {
    let query = match &model.prelude_prompt {
        Some(prelude) => format!("{}\n\n{}", prelude, task.query),
        None => task.query.clone(),
    };

    let mut messages = Vec::with_capacity(2);
    if let Some(system_prompt) = &model.system_prompt {
        messages.push(ChatMessage::system(system_prompt));
    }
    messages.push(ChatMessage::user(query));

    let mut request = ChatRequest::new(model.name.clone(), messages)
        .with_sampling(model.sampling_params.clone());

    // Tools require both a model that lists them and a configured bridge.
    let bridge = match (&ctx.bridge, model.tools.is_empty()) {
        (Some(bridge), false) => {
            request = request.with_tools(bridge.tool_specs(&model.tools).await?);
            Some(bridge.clone())
        }
        _ => None,
    };

    let agent = MultiStepGenerator::new(ctx.provider.clone(), bridge, ctx.config.max_agent_steps);
    let (response, steps) = agent.generate(&model.endpoint(), request).await?;

    let answer = response.first_content().map(|s| s.to_string());
    let usage = (
        response.usage.prompt_tokens,
        response.usage.completion_tokens,
    );

    Ok((answer, usage, steps))
}
