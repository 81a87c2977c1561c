//! Database schema constants.
//!
//! All DDL for the PostgreSQL storage backend. Statements are idempotent
//! (IF NOT EXISTS) and applied in order by the migration runner.

/// SQL schema for creating the datasets table.
pub const CREATE_DATASETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS datasets (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    rows JSONB NOT NULL,
    size BIGINT NOT NULL,
    has_query BOOLEAN NOT NULL DEFAULT FALSE,
    has_output BOOLEAN NOT NULL DEFAULT FALSE,
    has_output_true BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the models table.
pub const CREATE_MODELS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS models (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    base_url TEXT NOT NULL,
    api_key TEXT,
    system_prompt TEXT,
    prelude_prompt TEXT,
    sampling_params JSONB NOT NULL DEFAULT '{}',
    tools JSONB NOT NULL DEFAULT '[]',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the experiments table.
pub const CREATE_EXPERIMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS experiments (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    dataset_id BIGINT NOT NULL REFERENCES datasets(id),
    model_id BIGINT REFERENCES models(id),
    status VARCHAR(32) NOT NULL DEFAULT 'pending',
    num_try BIGINT NOT NULL DEFAULT 0,
    num_success BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the results table.
pub const CREATE_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS results (
    id BIGSERIAL PRIMARY KEY,
    experiment_id BIGINT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    metric_name TEXT NOT NULL,
    status VARCHAR(32) NOT NULL DEFAULT 'pending',
    num_try BIGINT NOT NULL DEFAULT 0,
    num_success BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (experiment_id, metric_name)
)
"#;

/// SQL schema for creating the answers table.
pub const CREATE_ANSWERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS answers (
    id BIGSERIAL PRIMARY KEY,
    experiment_id BIGINT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    row_index BIGINT NOT NULL,
    answer TEXT,
    error_msg TEXT,
    execution_ms BIGINT,
    prompt_tokens BIGINT,
    completion_tokens BIGINT,
    tool_call_count BIGINT,
    tool_steps JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (experiment_id, row_index)
)
"#;

/// SQL schema for creating the observations table.
pub const CREATE_OBSERVATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS observations (
    id BIGSERIAL PRIMARY KEY,
    result_id BIGINT NOT NULL REFERENCES results(id) ON DELETE CASCADE,
    row_index BIGINT NOT NULL,
    score DOUBLE PRECISION,
    observation TEXT,
    error_msg TEXT,
    execution_ms BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (result_id, row_index)
)
"#;

/// SQL for creating all required indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_experiments_status ON experiments(status);
CREATE INDEX IF NOT EXISTS idx_results_experiment_id ON results(experiment_id);
CREATE INDEX IF NOT EXISTS idx_answers_experiment_id ON answers(experiment_id);
CREATE INDEX IF NOT EXISTS idx_observations_result_id ON observations(result_id)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_DATASETS_TABLE,
        CREATE_MODELS_TABLE,
        CREATE_EXPERIMENTS_TABLE,
        CREATE_RESULTS_TABLE,
        CREATE_ANSWERS_TABLE,
        CREATE_OBSERVATIONS_TABLE,
        CREATE_INDEXES,
    ]
}

/// Table names in the schema.
pub mod tables {
    /// Datasets table name.
    pub const DATASETS: &str = "datasets";
    /// Models table name.
    pub const MODELS: &str = "models";
    /// Experiments table name.
    pub const EXPERIMENTS: &str = "experiments";
    /// Results table name.
    pub const RESULTS: &str = "results";
    /// Answers table name.
    pub const ANSWERS: &str = "answers";
    /// Observations table name.
    pub const OBSERVATIONS: &str = "observations";
}
