//! PostgreSQL implementation of the evaluation store.
//!
//! Counter updates are single `UPDATE ... RETURNING` statements so
//! concurrent workers never lose an increment; answer and observation
//! writes are `ON CONFLICT` upserts on their natural keys; status updates
//! carry their predecessor guard in the WHERE clause so regressions are
//! no-ops at the database, not just in application code.

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::llm::{SamplingParams, StepTrace};

use super::migrations::MigrationRunner;
use super::records::{
    Answer, AnswerWrite, Counters, Dataset, DatasetRow, Experiment, ExperimentStatus,
    MetricResult, Model, Observation, ObservationWrite, ResultStatus,
};
use super::{EvalStore, StoreError};

/// PostgreSQL-backed evaluation store.
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to the database and returns a new store.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    // =========================================================================
    // Creation helpers (used by the embedding API layer and seeding)
    // =========================================================================

    /// Inserts a dataset, computing size and column flags.
    pub async fn create_dataset(
        &self,
        name: &str,
        rows: Vec<DatasetRow>,
    ) -> Result<Dataset, StoreError> {
        let dataset = Dataset::new(0, name, rows);
        let rows_json = serde_json::to_value(&dataset.rows)?;

        let row = sqlx::query(
            r#"
            INSERT INTO datasets (name, rows, size, has_query, has_output, has_output_true)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(&rows_json)
        .bind(dataset.size as i64)
        .bind(dataset.has_query)
        .bind(dataset.has_output)
        .bind(dataset.has_output_true)
        .fetch_one(&self.pool)
        .await?;

        Ok(Dataset {
            id: row.get("id"),
            ..dataset
        })
    }

    /// Inserts a model.
    pub async fn create_model(&self, model: &Model) -> Result<i64, StoreError> {
        let sampling = serde_json::to_value(&model.sampling_params)?;
        let tools = serde_json::to_value(&model.tools)?;

        let row = sqlx::query(
            r#"
            INSERT INTO models (name, base_url, api_key, system_prompt, prelude_prompt, sampling_params, tools)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&model.name)
        .bind(&model.base_url)
        .bind(&model.api_key)
        .bind(&model.system_prompt)
        .bind(&model.prelude_prompt)
        .bind(&sampling)
        .bind(&tools)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    /// Inserts an experiment with one pending result per requested metric.
    pub async fn create_experiment(
        &self,
        name: &str,
        dataset_id: i64,
        model_id: Option<i64>,
        metric_names: &[String],
    ) -> Result<Experiment, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO experiments (name, dataset_id, model_id, status)
            VALUES ($1, $2, $3, 'pending')
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(dataset_id)
        .bind(model_id)
        .fetch_one(&mut *tx)
        .await?;
        let experiment_id: i64 = row.get("id");

        for metric_name in metric_names {
            sqlx::query(
                r#"
                INSERT INTO results (experiment_id, metric_name, status)
                VALUES ($1, $2, 'pending')
                ON CONFLICT (experiment_id, metric_name) DO NOTHING
                "#,
            )
            .bind(experiment_id)
            .bind(metric_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Experiment {
            id: experiment_id,
            name: name.to_string(),
            dataset_id,
            model_id,
            status: ExperimentStatus::Pending,
            counters: Counters::default(),
        })
    }
}

fn parse_experiment_status(raw: &str) -> Result<ExperimentStatus, StoreError> {
    ExperimentStatus::parse(raw)
        .ok_or_else(|| StoreError::Invalid(format!("unknown experiment status '{}'", raw)))
}

fn parse_result_status(raw: &str) -> Result<ResultStatus, StoreError> {
    ResultStatus::parse(raw)
        .ok_or_else(|| StoreError::Invalid(format!("unknown result status '{}'", raw)))
}

fn result_from_row(row: &sqlx::postgres::PgRow) -> Result<MetricResult, StoreError> {
    let raw_status: String = row.get("status");
    Ok(MetricResult {
        id: row.get("id"),
        experiment_id: row.get("experiment_id"),
        metric_name: row.get("metric_name"),
        status: parse_result_status(&raw_status)?,
        counters: Counters {
            num_try: row.get::<i64, _>("num_try") as u64,
            num_success: row.get::<i64, _>("num_success") as u64,
        },
    })
}

#[async_trait]
impl EvalStore for Database {
    async fn get_dataset(&self, id: i64) -> Result<Option<Dataset>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, rows, size, has_query, has_output, has_output_true
            FROM datasets WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let rows_json: serde_json::Value = row.get("rows");
        let rows: Vec<DatasetRow> = serde_json::from_value(rows_json)?;

        Ok(Some(Dataset {
            id: row.get("id"),
            name: row.get("name"),
            rows,
            size: row.get::<i64, _>("size") as usize,
            has_query: row.get("has_query"),
            has_output: row.get("has_output"),
            has_output_true: row.get("has_output_true"),
        }))
    }

    async fn get_model(&self, id: i64) -> Result<Option<Model>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, base_url, api_key, system_prompt, prelude_prompt,
                   sampling_params, tools
            FROM models WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let sampling: SamplingParams = serde_json::from_value(row.get("sampling_params"))?;
        let tools: Vec<String> = serde_json::from_value(row.get("tools"))?;

        Ok(Some(Model {
            id: row.get("id"),
            name: row.get("name"),
            base_url: row.get("base_url"),
            api_key: row.get("api_key"),
            system_prompt: row.get("system_prompt"),
            prelude_prompt: row.get("prelude_prompt"),
            sampling_params: sampling,
            tools,
        }))
    }

    async fn get_experiment(&self, id: i64) -> Result<Option<Experiment>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, dataset_id, model_id, status, num_try, num_success
            FROM experiments WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let raw_status: String = row.get("status");
        Ok(Some(Experiment {
            id: row.get("id"),
            name: row.get("name"),
            dataset_id: row.get("dataset_id"),
            model_id: row.get("model_id"),
            status: parse_experiment_status(&raw_status)?,
            counters: Counters {
                num_try: row.get::<i64, _>("num_try") as u64,
                num_success: row.get::<i64, _>("num_success") as u64,
            },
        }))
    }

    async fn get_result(
        &self,
        experiment_id: i64,
        metric_name: &str,
    ) -> Result<Option<MetricResult>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, experiment_id, metric_name, status, num_try, num_success
            FROM results WHERE experiment_id = $1 AND metric_name = $2
            "#,
        )
        .bind(experiment_id)
        .bind(metric_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(result_from_row).transpose()
    }

    async fn list_results(&self, experiment_id: i64) -> Result<Vec<MetricResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, experiment_id, metric_name, status, num_try, num_success
            FROM results WHERE experiment_id = $1 ORDER BY id
            "#,
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(result_from_row).collect()
    }

    async fn get_answer(
        &self,
        experiment_id: i64,
        row_index: usize,
    ) -> Result<Option<Answer>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT experiment_id, row_index, answer, error_msg, execution_ms,
                   prompt_tokens, completion_tokens, tool_call_count, tool_steps
            FROM answers WHERE experiment_id = $1 AND row_index = $2
            "#,
        )
        .bind(experiment_id)
        .bind(row_index as i64)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let tool_steps: StepTrace = match row.get::<Option<serde_json::Value>, _>("tool_steps") {
            Some(value) => serde_json::from_value(value)?,
            None => StepTrace::new(),
        };

        Ok(Some(Answer {
            experiment_id: row.get("experiment_id"),
            row_index: row.get::<i64, _>("row_index") as usize,
            answer: row.get("answer"),
            error_msg: row.get("error_msg"),
            execution_ms: row.get::<Option<i64>, _>("execution_ms").map(|v| v as u64),
            prompt_tokens: row
                .get::<Option<i64>, _>("prompt_tokens")
                .map(|v| v as u32),
            completion_tokens: row
                .get::<Option<i64>, _>("completion_tokens")
                .map(|v| v as u32),
            tool_call_count: row
                .get::<Option<i64>, _>("tool_call_count")
                .map(|v| v as u32),
            tool_steps,
        }))
    }

    async fn get_observation(
        &self,
        result_id: i64,
        row_index: usize,
    ) -> Result<Option<Observation>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT result_id, row_index, score, observation, error_msg, execution_ms
            FROM observations WHERE result_id = $1 AND row_index = $2
            "#,
        )
        .bind(result_id)
        .bind(row_index as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Observation {
            result_id: row.get("result_id"),
            row_index: row.get::<i64, _>("row_index") as usize,
            score: row.get("score"),
            observation: row.get("observation"),
            error_msg: row.get("error_msg"),
            execution_ms: row.get::<Option<i64>, _>("execution_ms").map(|v| v as u64),
        }))
    }

    async fn upsert_answer(
        &self,
        experiment_id: i64,
        row_index: usize,
        write: AnswerWrite,
    ) -> Result<(), StoreError> {
        match write {
            AnswerWrite::Success {
                answer,
                execution_ms,
                prompt_tokens,
                completion_tokens,
                tool_steps,
            } => {
                let tool_call_count: i64 =
                    tool_steps.iter().map(|turn| turn.len() as i64).sum();
                let steps_json = serde_json::to_value(&tool_steps)?;

                sqlx::query(
                    r#"
                    INSERT INTO answers (
                        experiment_id, row_index, answer, error_msg, execution_ms,
                        prompt_tokens, completion_tokens, tool_call_count, tool_steps
                    ) VALUES ($1, $2, $3, NULL, $4, $5, $6, $7, $8)
                    ON CONFLICT (experiment_id, row_index) DO UPDATE SET
                        answer = EXCLUDED.answer,
                        error_msg = NULL,
                        execution_ms = EXCLUDED.execution_ms,
                        prompt_tokens = EXCLUDED.prompt_tokens,
                        completion_tokens = EXCLUDED.completion_tokens,
                        tool_call_count = EXCLUDED.tool_call_count,
                        tool_steps = EXCLUDED.tool_steps,
                        updated_at = NOW()
                    "#,
                )
                .bind(experiment_id)
                .bind(row_index as i64)
                .bind(&answer)
                .bind(execution_ms as i64)
                .bind(prompt_tokens as i64)
                .bind(completion_tokens as i64)
                .bind(tool_call_count)
                .bind(&steps_json)
                .execute(&self.pool)
                .await?;
            }
            AnswerWrite::Failure { error_msg } => {
                sqlx::query(
                    r#"
                    INSERT INTO answers (experiment_id, row_index, error_msg)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (experiment_id, row_index) DO UPDATE SET
                        error_msg = EXCLUDED.error_msg,
                        updated_at = NOW()
                    "#,
                )
                .bind(experiment_id)
                .bind(row_index as i64)
                .bind(&error_msg)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    async fn upsert_observation(
        &self,
        result_id: i64,
        row_index: usize,
        write: ObservationWrite,
    ) -> Result<(), StoreError> {
        match write {
            ObservationWrite::Success {
                score,
                observation,
                execution_ms,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO observations (result_id, row_index, score, observation, error_msg, execution_ms)
                    VALUES ($1, $2, $3, $4, NULL, $5)
                    ON CONFLICT (result_id, row_index) DO UPDATE SET
                        score = EXCLUDED.score,
                        observation = EXCLUDED.observation,
                        error_msg = NULL,
                        execution_ms = EXCLUDED.execution_ms,
                        updated_at = NOW()
                    "#,
                )
                .bind(result_id)
                .bind(row_index as i64)
                .bind(score)
                .bind(&observation)
                .bind(execution_ms as i64)
                .execute(&self.pool)
                .await?;
            }
            ObservationWrite::Failure { error_msg } => {
                sqlx::query(
                    r#"
                    INSERT INTO observations (result_id, row_index, error_msg)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (result_id, row_index) DO UPDATE SET
                        error_msg = EXCLUDED.error_msg,
                        updated_at = NOW()
                    "#,
                )
                .bind(result_id)
                .bind(row_index as i64)
                .bind(&error_msg)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    async fn clear_answer_error(
        &self,
        experiment_id: i64,
        row_index: usize,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE answers SET error_msg = NULL, updated_at = NOW() \
             WHERE experiment_id = $1 AND row_index = $2",
        )
        .bind(experiment_id)
        .bind(row_index as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_observation_error(
        &self,
        result_id: i64,
        row_index: usize,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE observations SET error_msg = NULL, updated_at = NOW() \
             WHERE result_id = $1 AND row_index = $2",
        )
        .bind(result_id)
        .bind(row_index as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bump_experiment_counters(
        &self,
        id: i64,
        success: bool,
    ) -> Result<Counters, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE experiments
            SET num_try = num_try + 1, num_success = num_success + $2
            WHERE id = $1
            RETURNING num_try, num_success
            "#,
        )
        .bind(id)
        .bind(if success { 1i64 } else { 0i64 })
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("experiment {}", id)))?;

        Ok(Counters {
            num_try: row.get::<i64, _>("num_try") as u64,
            num_success: row.get::<i64, _>("num_success") as u64,
        })
    }

    async fn bump_result_counters(
        &self,
        id: i64,
        success: bool,
    ) -> Result<Counters, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE results
            SET num_try = num_try + 1, num_success = num_success + $2
            WHERE id = $1
            RETURNING num_try, num_success
            "#,
        )
        .bind(id)
        .bind(if success { 1i64 } else { 0i64 })
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("result {}", id)))?;

        Ok(Counters {
            num_try: row.get::<i64, _>("num_try") as u64,
            num_success: row.get::<i64, _>("num_success") as u64,
        })
    }

    async fn reconcile_experiment_counters(&self, id: i64) -> Result<Counters, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE experiments
            SET num_try = sub.successes, num_success = sub.successes
            FROM (
                SELECT count(*) FILTER (
                    WHERE answer IS NOT NULL AND answer <> '' AND error_msg IS NULL
                ) AS successes
                FROM answers WHERE experiment_id = $1
            ) AS sub
            WHERE id = $1
            RETURNING num_try, num_success
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("experiment {}", id)))?;

        Ok(Counters {
            num_try: row.get::<i64, _>("num_try") as u64,
            num_success: row.get::<i64, _>("num_success") as u64,
        })
    }

    async fn reconcile_result_counters(&self, id: i64) -> Result<Counters, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE results
            SET num_try = sub.successes, num_success = sub.successes
            FROM (
                SELECT count(*) FILTER (
                    WHERE score IS NOT NULL AND error_msg IS NULL
                ) AS successes
                FROM observations WHERE result_id = $1
            ) AS sub
            WHERE id = $1
            RETURNING num_try, num_success
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("result {}", id)))?;

        Ok(Counters {
            num_try: row.get::<i64, _>("num_try") as u64,
            num_success: row.get::<i64, _>("num_success") as u64,
        })
    }

    async fn advance_experiment_status(
        &self,
        id: i64,
        to: ExperimentStatus,
    ) -> Result<(), StoreError> {
        let predecessors: Vec<String> = ExperimentStatus::all()
            .iter()
            .filter(|s| s.can_advance_to(to))
            .map(|s| s.as_str().to_string())
            .collect();

        sqlx::query(
            "UPDATE experiments SET status = $2 WHERE id = $1 AND status = ANY($3)",
        )
        .bind(id)
        .bind(to.as_str())
        .bind(&predecessors)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn advance_result_status(&self, id: i64, to: ResultStatus) -> Result<(), StoreError> {
        let predecessors: Vec<String> = ResultStatus::all()
            .iter()
            .filter(|s| s.can_advance_to(to))
            .map(|s| s.as_str().to_string())
            .collect();

        sqlx::query("UPDATE results SET status = $2 WHERE id = $1 AND status = ANY($3)")
            .bind(id)
            .bind(to.as_str())
            .bind(&predecessors)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
