//! End-to-end tests of the dispatch → drain → finish flow.
//!
//! The engine runs against in-memory fakes of the store, the queue and
//! the generation provider, so these tests exercise real concurrency
//! (multiple workers, randomized latencies, injected failures) without
//! external services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use evalforge::config::RunnerConfig;
use evalforge::error::LlmError;
use evalforge::llm::{
    ChatChoice, ChatMessage, ChatRequest, ChatResponse, GenerationProvider, ModelEndpoint,
    TokenUsage,
};
use evalforge::metrics::MetricRegistry;
use evalforge::runner::generate::run_generation_task;
use evalforge::runner::{
    Envelope, EvalTask, GenerationTask, QueueError, RunnerContext, TaskQueue, WorkerPool,
};
use evalforge::storage::{
    Answer, AnswerWrite, Counters, Dataset, DatasetRow, EvalStore, Experiment, ExperimentStatus,
    MetricResult, Model, Observation, ObservationWrite, ResultStatus, StoreError,
};

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    datasets: HashMap<i64, Dataset>,
    models: HashMap<i64, Model>,
    experiments: HashMap<i64, Experiment>,
    results: HashMap<i64, MetricResult>,
    answers: HashMap<(i64, usize), Answer>,
    observations: HashMap<(i64, usize), Observation>,
}

#[derive(Default)]
struct MemoryStore {
    state: Mutex<MemoryState>,
    next_id: AtomicI64,
}

impl MemoryStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1),
            ..Default::default()
        })
    }

    fn id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn insert_dataset(&self, rows: Vec<DatasetRow>) -> i64 {
        let id = self.id();
        let dataset = Dataset::new(id, format!("dataset-{}", id), rows);
        self.state.lock().unwrap().datasets.insert(id, dataset);
        id
    }

    fn insert_model(&self, model: Model) -> i64 {
        let id = self.id();
        let model = Model { id, ..model };
        self.state.lock().unwrap().models.insert(id, model);
        id
    }

    fn insert_experiment(
        &self,
        dataset_id: i64,
        model_id: Option<i64>,
        metric_names: &[&str],
    ) -> i64 {
        let id = self.id();
        let mut state = self.state.lock().unwrap();
        state.experiments.insert(
            id,
            Experiment {
                id,
                name: format!("experiment-{}", id),
                dataset_id,
                model_id,
                status: ExperimentStatus::Pending,
                counters: Counters::default(),
            },
        );
        drop(state);

        for metric_name in metric_names {
            let result_id = self.id();
            self.state.lock().unwrap().results.insert(
                result_id,
                MetricResult {
                    id: result_id,
                    experiment_id: id,
                    metric_name: metric_name.to_string(),
                    status: ResultStatus::Pending,
                    counters: Counters::default(),
                },
            );
        }

        id
    }

    /// External reopen operation: reset a finished run back to pending.
    fn reset_to_pending(&self, experiment_id: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(exp) = state.experiments.get_mut(&experiment_id) {
            exp.status = ExperimentStatus::Pending;
        }
        for result in state.results.values_mut() {
            if result.experiment_id == experiment_id {
                result.status = ResultStatus::Pending;
            }
        }
    }

    fn answer_count(&self, experiment_id: i64) -> usize {
        self.state
            .lock()
            .unwrap()
            .answers
            .keys()
            .filter(|(exp, _)| *exp == experiment_id)
            .count()
    }
}

#[async_trait]
impl EvalStore for MemoryStore {
    async fn get_dataset(&self, id: i64) -> Result<Option<Dataset>, StoreError> {
        Ok(self.state.lock().unwrap().datasets.get(&id).cloned())
    }

    async fn get_model(&self, id: i64) -> Result<Option<Model>, StoreError> {
        Ok(self.state.lock().unwrap().models.get(&id).cloned())
    }

    async fn get_experiment(&self, id: i64) -> Result<Option<Experiment>, StoreError> {
        Ok(self.state.lock().unwrap().experiments.get(&id).cloned())
    }

    async fn get_result(
        &self,
        experiment_id: i64,
        metric_name: &str,
    ) -> Result<Option<MetricResult>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .results
            .values()
            .find(|r| r.experiment_id == experiment_id && r.metric_name == metric_name)
            .cloned())
    }

    async fn list_results(&self, experiment_id: i64) -> Result<Vec<MetricResult>, StoreError> {
        let mut results: Vec<MetricResult> = self
            .state
            .lock()
            .unwrap()
            .results
            .values()
            .filter(|r| r.experiment_id == experiment_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.id);
        Ok(results)
    }

    async fn get_answer(
        &self,
        experiment_id: i64,
        row_index: usize,
    ) -> Result<Option<Answer>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .answers
            .get(&(experiment_id, row_index))
            .cloned())
    }

    async fn get_observation(
        &self,
        result_id: i64,
        row_index: usize,
    ) -> Result<Option<Observation>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .observations
            .get(&(result_id, row_index))
            .cloned())
    }

    async fn upsert_answer(
        &self,
        experiment_id: i64,
        row_index: usize,
        write: AnswerWrite,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .answers
            .entry((experiment_id, row_index))
            .or_insert_with(|| Answer {
                experiment_id,
                row_index,
                ..Default::default()
            });

        match write {
            AnswerWrite::Success {
                answer,
                execution_ms,
                prompt_tokens,
                completion_tokens,
                tool_steps,
            } => {
                entry.answer = answer;
                entry.error_msg = None;
                entry.execution_ms = Some(execution_ms);
                entry.prompt_tokens = Some(prompt_tokens);
                entry.completion_tokens = Some(completion_tokens);
                entry.tool_call_count =
                    Some(tool_steps.iter().map(|turn| turn.len() as u32).sum());
                entry.tool_steps = tool_steps;
            }
            AnswerWrite::Failure { error_msg } => {
                entry.error_msg = Some(error_msg);
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
        let mut state = self.state.lock().unwrap();
        let entry = state
            .observations
            .entry((result_id, row_index))
            .or_insert_with(|| Observation {
                result_id,
                row_index,
                ..Default::default()
            });

        match write {
            ObservationWrite::Success {
                score,
                observation,
                execution_ms,
            } => {
                entry.score = score;
                entry.observation = observation;
                entry.error_msg = None;
                entry.execution_ms = Some(execution_ms);
            }
            ObservationWrite::Failure { error_msg } => {
                entry.error_msg = Some(error_msg);
            }
        }
        Ok(())
    }

    async fn clear_answer_error(
        &self,
        experiment_id: i64,
        row_index: usize,
    ) -> Result<(), StoreError> {
        if let Some(answer) = self
            .state
            .lock()
            .unwrap()
            .answers
            .get_mut(&(experiment_id, row_index))
        {
            answer.error_msg = None;
        }
        Ok(())
    }

    async fn clear_observation_error(
        &self,
        result_id: i64,
        row_index: usize,
    ) -> Result<(), StoreError> {
        if let Some(obs) = self
            .state
            .lock()
            .unwrap()
            .observations
            .get_mut(&(result_id, row_index))
        {
            obs.error_msg = None;
        }
        Ok(())
    }

    async fn bump_experiment_counters(
        &self,
        id: i64,
        success: bool,
    ) -> Result<Counters, StoreError> {
        let mut state = self.state.lock().unwrap();
        let exp = state
            .experiments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("experiment {}", id)))?;
        exp.counters.num_try += 1;
        if success {
            exp.counters.num_success += 1;
        }
        Ok(exp.counters)
    }

    async fn bump_result_counters(
        &self,
        id: i64,
        success: bool,
    ) -> Result<Counters, StoreError> {
        let mut state = self.state.lock().unwrap();
        let result = state
            .results
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("result {}", id)))?;
        result.counters.num_try += 1;
        if success {
            result.counters.num_success += 1;
        }
        Ok(result.counters)
    }

    async fn reconcile_experiment_counters(&self, id: i64) -> Result<Counters, StoreError> {
        let mut state = self.state.lock().unwrap();
        let successes = state
            .answers
            .values()
            .filter(|a| a.experiment_id == id && a.is_success())
            .count() as u64;
        let exp = state
            .experiments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("experiment {}", id)))?;
        exp.counters = Counters {
            num_try: successes,
            num_success: successes,
        };
        Ok(exp.counters)
    }

    async fn reconcile_result_counters(&self, id: i64) -> Result<Counters, StoreError> {
        let mut state = self.state.lock().unwrap();
        let successes = state
            .observations
            .values()
            .filter(|o| o.result_id == id && o.is_success())
            .count() as u64;
        let result = state
            .results
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("result {}", id)))?;
        result.counters = Counters {
            num_try: successes,
            num_success: successes,
        };
        Ok(result.counters)
    }

    async fn advance_experiment_status(
        &self,
        id: i64,
        to: ExperimentStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(exp) = state.experiments.get_mut(&id) {
            if exp.status.can_advance_to(to) {
                exp.status = to;
            }
        }
        Ok(())
    }

    async fn advance_result_status(&self, id: i64, to: ResultStatus) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(result) = state.results.get_mut(&id) {
            if result.status.can_advance_to(to) {
                result.status = to;
            }
        }
        Ok(())
    }
}

// ============================================================================
// In-memory queue
// ============================================================================

#[derive(Default)]
struct MemoryQueue {
    pending: Mutex<Vec<Envelope>>,
    processing: Mutex<Vec<Envelope>>,
    notify: Notify,
}

impl MemoryQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn pop(&self) -> Option<Envelope> {
        let envelope = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return None;
            }
            pending.remove(0)
        };
        self.processing.lock().unwrap().push(envelope.clone());
        Some(envelope)
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, envelope: Envelope) -> Result<(), QueueError> {
        self.pending.lock().unwrap().push(envelope);
        self.notify.notify_one();
        Ok(())
    }

    async fn enqueue_batch(&self, envelopes: Vec<Envelope>) -> Result<(), QueueError> {
        let count = envelopes.len();
        self.pending.lock().unwrap().extend(envelopes);
        for _ in 0..count {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Envelope>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(envelope) = self.pop() {
                return Ok(Some(envelope));
            }
            let notified = self.notify.notified();
            if let Some(envelope) = self.pop() {
                return Ok(Some(envelope));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, envelope_id: Uuid) -> Result<(), QueueError> {
        let mut processing = self.processing.lock().unwrap();
        processing.retain(|e| e.id != envelope_id);
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let drained: Vec<Envelope> = self.processing.lock().unwrap().drain(..).collect();
        let recovered = drained.len();
        self.pending.lock().unwrap().extend(drained);
        for _ in 0..recovered {
            self.notify.notify_one();
        }
        Ok(recovered)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.pending.lock().unwrap().len())
    }
}

// ============================================================================
// Fake provider
// ============================================================================

/// Echoes "echo:{query}" back, with optional per-query failures and small
/// deterministic latency jitter to shuffle worker interleavings.
struct EchoProvider {
    failing_queries: Vec<String>,
    jitter: bool,
    calls: AtomicUsize,
}

impl EchoProvider {
    fn new() -> Self {
        Self {
            failing_queries: Vec::new(),
            jitter: false,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(mut self, queries: &[&str]) -> Self {
        self.failing_queries = queries.iter().map(|q| q.to_string()).collect();
        self
    }

    fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }
}

#[async_trait]
impl GenerationProvider for EchoProvider {
    async fn generate(
        &self,
        _endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
        if self.jitter {
            tokio::time::sleep(Duration::from_millis(call * 7 % 13 + 1)).await;
        }

        let query = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .and_then(|m| m.content.clone())
            .unwrap_or_default();

        if self.failing_queries.contains(&query) {
            return Err(LlmError::RequestFailed(format!(
                "synthetic outage for '{}'",
                query
            )));
        }

        Ok(ChatResponse {
            id: String::new(),
            model: "echo".to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::assistant(format!("echo:{}", query)),
                finish_reason: Some("stop".to_string()),
            }],
            usage: TokenUsage {
                prompt_tokens: 7,
                completion_tokens: 11,
                total_tokens: 18,
            },
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

fn qa_rows(n: usize) -> Vec<DatasetRow> {
    (0..n)
        .map(|i| {
            let mut row = DatasetRow::new();
            row.insert("query".to_string(), serde_json::json!(format!("q{}", i)));
            row.insert(
                "output_true".to_string(),
                serde_json::json!(format!("echo:q{}", i)),
            );
            row
        })
        .collect()
}

fn echo_model() -> Model {
    Model {
        id: 0,
        name: "echo".to_string(),
        base_url: "http://localhost".to_string(),
        api_key: None,
        system_prompt: None,
        prelude_prompt: None,
        sampling_params: Default::default(),
        tools: Vec::new(),
    }
}

fn context(
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    provider: Arc<dyn GenerationProvider>,
    workers: usize,
) -> Arc<RunnerContext> {
    let config = RunnerConfig::new()
        .with_num_workers(workers)
        .with_poll_interval(Duration::from_millis(50));

    let store: Arc<dyn EvalStore> = store;
    let queue: Arc<dyn TaskQueue> = queue;
    Arc::new(RunnerContext {
        store,
        queue,
        provider,
        bridge: None,
        metrics: Arc::new(MetricRegistry::builtin()),
        config,
    })
}

async fn wait_for_experiment_status(
    store: &Arc<MemoryStore>,
    experiment_id: i64,
    status: ExperimentStatus,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = store
            .get_experiment(experiment_id)
            .await
            .unwrap()
            .unwrap()
            .status;
        if current == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "experiment {} stuck in status {}",
            experiment_id,
            current
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn run_to_finished(ctx: Arc<RunnerContext>, store: &Arc<MemoryStore>, experiment_id: i64) {
    let mut pool = WorkerPool::new(ctx);
    pool.start().await.unwrap();
    wait_for_experiment_status(store, experiment_id, ExperimentStatus::Finished).await;
    pool.shutdown().await.unwrap();
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_generation_then_scoring_drains_to_finished() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let dataset_id = store.insert_dataset(qa_rows(5));
    let model_id = store.insert_model(echo_model());
    let experiment_id = store.insert_experiment(dataset_id, Some(model_id), &["exact_match"]);

    let ctx = context(
        store.clone(),
        queue.clone(),
        Arc::new(EchoProvider::new()),
        4,
    );
    ctx.dispatcher().dispatch(experiment_id).await.unwrap();
    run_to_finished(ctx, &store, experiment_id).await;

    let experiment = store.get_experiment(experiment_id).await.unwrap().unwrap();
    assert_eq!(experiment.counters.num_try, 5);
    assert_eq!(experiment.counters.num_success, 5);

    let results = store.list_results(experiment_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ResultStatus::Finished);
    assert_eq!(results[0].counters.num_try, 5);
    assert_eq!(results[0].counters.num_success, 5);

    // Every row scored a perfect match.
    for row_index in 0..5 {
        let obs = store
            .get_observation(results[0].id, row_index)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(obs.score, Some(1.0));
        assert!(obs.error_msg.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counters_converge_when_rows_fail() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let dataset_id = store.insert_dataset(qa_rows(12));
    let model_id = store.insert_model(echo_model());
    let experiment_id =
        store.insert_experiment(dataset_id, Some(model_id), &["exact_match", "output_length"]);

    let provider = EchoProvider::new().failing(&["q2", "q7", "q11"]);
    let ctx = context(store.clone(), queue.clone(), Arc::new(provider), 4);
    ctx.dispatcher().dispatch(experiment_id).await.unwrap();
    run_to_finished(ctx, &store, experiment_id).await;

    // num_try always reaches the dataset size, failures included.
    let experiment = store.get_experiment(experiment_id).await.unwrap().unwrap();
    assert_eq!(experiment.counters.num_try, 12);
    assert_eq!(experiment.counters.num_success, 9);

    for result in store.list_results(experiment_id).await.unwrap() {
        assert_eq!(result.status, ResultStatus::Finished);
        assert_eq!(result.counters.num_try, 12);
        // Failed generations score nothing, for either metric.
        assert_eq!(result.counters.num_success, 9);
        assert!(result.counters.num_success <= result.counters.num_try);
    }

    // Failed rows carry their error; successful rows don't.
    let failed = store.get_answer(experiment_id, 2).await.unwrap().unwrap();
    assert!(failed.answer.is_none());
    assert!(failed.error_msg.as_deref().unwrap().contains("q2"));

    let ok = store.get_answer(experiment_id, 0).await.unwrap().unwrap();
    assert_eq!(ok.answer.as_deref(), Some("echo:q0"));
    assert!(ok.error_msg.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invariants_under_concurrent_workers() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let dataset_id = store.insert_dataset(qa_rows(30));
    let model_id = store.insert_model(echo_model());
    let experiment_id =
        store.insert_experiment(dataset_id, Some(model_id), &["exact_match", "output_length"]);

    let provider = EchoProvider::new()
        .failing(&["q5", "q17", "q23"])
        .with_jitter();
    let ctx = context(store.clone(), queue.clone(), Arc::new(provider), 8);
    ctx.dispatcher().dispatch(experiment_id).await.unwrap();
    run_to_finished(ctx, &store, experiment_id).await;

    let experiment = store.get_experiment(experiment_id).await.unwrap().unwrap();
    assert_eq!(experiment.counters.num_try, 30);
    assert_eq!(experiment.counters.num_success, 27);
    assert!(experiment.counters.num_success <= experiment.counters.num_try);

    for result in store.list_results(experiment_id).await.unwrap() {
        assert_eq!(result.counters.num_try, 30);
        assert!(result.counters.num_success <= result.counters.num_try);
        assert_eq!(result.status, ResultStatus::Finished);
    }

    // One answer row per dataset row, no duplicates from interleaving.
    assert_eq!(store.answer_count(experiment_id), 30);
}

#[tokio::test]
async fn test_redelivered_generation_task_upserts_once() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let dataset_id = store.insert_dataset(qa_rows(2));
    let model_id = store.insert_model(echo_model());
    let experiment_id = store.insert_experiment(dataset_id, Some(model_id), &["exact_match"]);

    let ctx = context(
        store.clone(),
        queue.clone(),
        Arc::new(EchoProvider::new()),
        1,
    );

    let task = GenerationTask {
        experiment_id,
        model_id,
        row_index: 0,
        query: "q0".to_string(),
        follow_scoring: false,
    };

    // At-least-once delivery: the same task arrives twice.
    run_generation_task(&ctx, &task).await.unwrap();
    run_generation_task(&ctx, &task).await.unwrap();

    // Exactly one answer row; num_try legitimately counts both deliveries.
    assert_eq!(store.answer_count(experiment_id), 1);
    let answer = store.get_answer(experiment_id, 0).await.unwrap().unwrap();
    assert_eq!(answer.answer.as_deref(), Some("echo:q0"));

    let experiment = store.get_experiment(experiment_id).await.unwrap().unwrap();
    assert_eq!(experiment.counters.num_try, 2);
    assert_eq!(experiment.counters.num_success, 2);
}

#[tokio::test]
async fn test_scoring_tasks_enqueued_once_per_metric_per_row() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let dataset_id = store.insert_dataset(qa_rows(3));
    let model_id = store.insert_model(echo_model());
    let experiment_id =
        store.insert_experiment(dataset_id, Some(model_id), &["exact_match", "output_length"]);

    let ctx = context(
        store.clone(),
        queue.clone(),
        Arc::new(EchoProvider::new()),
        1,
    );
    ctx.dispatcher().dispatch(experiment_id).await.unwrap();

    // Drive the queue by hand: execute generation tasks, record scoring
    // tasks as they appear.
    let mut scoring_seen: HashMap<(String, usize), usize> = HashMap::new();
    while let Some(envelope) = queue.dequeue(Duration::from_millis(50)).await.unwrap() {
        match &envelope.task {
            EvalTask::Generation(task) => {
                run_generation_task(&ctx, task).await.unwrap();
            }
            EvalTask::Scoring(task) => {
                *scoring_seen
                    .entry((task.metric_name.clone(), task.row_index))
                    .or_default() += 1;
            }
        }
        queue.ack(envelope.id).await.unwrap();
    }

    // After the last generation, every (metric, row) pair was enqueued
    // exactly once.
    assert_eq!(scoring_seen.len(), 6);
    for ((metric, row_index), count) in &scoring_seen {
        assert_eq!(
            *count, 1,
            "metric {} row {} enqueued {} times",
            metric, row_index, count
        );
    }

    // Scoring was only dispatched after the answers were terminal.
    let experiment = store.get_experiment(experiment_id).await.unwrap().unwrap();
    assert_eq!(experiment.status, ExperimentStatus::RunningScoring);
    assert_eq!(store.answer_count(experiment_id), 3);
}

#[tokio::test]
async fn test_dataset_with_outputs_skips_generation() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();

    // Dataset ships its own outputs; no model is attached.
    let rows: Vec<DatasetRow> = (0..4)
        .map(|i| {
            let mut row = DatasetRow::new();
            row.insert("output".to_string(), serde_json::json!(format!("o{}", i)));
            row.insert(
                "output_true".to_string(),
                serde_json::json!(format!("o{}", i)),
            );
            row
        })
        .collect();
    let dataset_id = store.insert_dataset(rows);
    let experiment_id = store.insert_experiment(dataset_id, None, &["exact_match"]);

    let ctx = context(
        store.clone(),
        queue.clone(),
        Arc::new(EchoProvider::new()),
        2,
    );
    ctx.dispatcher().dispatch(experiment_id).await.unwrap();

    // Straight to scoring.
    let experiment = store.get_experiment(experiment_id).await.unwrap().unwrap();
    assert_eq!(experiment.status, ExperimentStatus::RunningScoring);

    run_to_finished(ctx, &store, experiment_id).await;

    let experiment = store.get_experiment(experiment_id).await.unwrap().unwrap();
    assert_eq!(experiment.status, ExperimentStatus::Finished);
    // Generation counters untouched; no answers were produced.
    assert_eq!(experiment.counters.num_try, 0);
    assert_eq!(store.answer_count(experiment_id), 0);

    let results = store.list_results(experiment_id).await.unwrap();
    assert_eq!(results[0].counters.num_try, 4);
    assert_eq!(results[0].counters.num_success, 4);
}

#[tokio::test]
async fn test_missing_required_input_fails_row_but_converges() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();

    // No output_true column at all: exact_match can never run.
    let rows: Vec<DatasetRow> = (0..3)
        .map(|i| {
            let mut row = DatasetRow::new();
            row.insert("query".to_string(), serde_json::json!(format!("q{}", i)));
            row
        })
        .collect();
    let dataset_id = store.insert_dataset(rows);
    let model_id = store.insert_model(echo_model());
    let experiment_id = store.insert_experiment(dataset_id, Some(model_id), &["exact_match"]);

    let ctx = context(
        store.clone(),
        queue.clone(),
        Arc::new(EchoProvider::new()),
        2,
    );
    ctx.dispatcher().dispatch(experiment_id).await.unwrap();
    run_to_finished(ctx, &store, experiment_id).await;

    let results = store.list_results(experiment_id).await.unwrap();
    assert_eq!(results[0].status, ResultStatus::Finished);
    assert_eq!(results[0].counters.num_try, 3);
    assert_eq!(results[0].counters.num_success, 0);

    for row_index in 0..3 {
        let obs = store
            .get_observation(results[0].id, row_index)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(obs.score, None);
        assert!(obs.error_msg.as_deref().unwrap().contains("output_true"));
    }
}

#[tokio::test]
async fn test_unknown_metric_fails_rows_with_error() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let dataset_id = store.insert_dataset(qa_rows(2));
    let model_id = store.insert_model(echo_model());
    let experiment_id = store.insert_experiment(dataset_id, Some(model_id), &["judge_made_up"]);

    let ctx = context(
        store.clone(),
        queue.clone(),
        Arc::new(EchoProvider::new()),
        2,
    );
    ctx.dispatcher().dispatch(experiment_id).await.unwrap();
    run_to_finished(ctx, &store, experiment_id).await;

    let results = store.list_results(experiment_id).await.unwrap();
    assert_eq!(results[0].counters.num_try, 2);
    assert_eq!(results[0].counters.num_success, 0);

    let obs = store
        .get_observation(results[0].id, 0)
        .await
        .unwrap()
        .unwrap();
    assert!(obs.error_msg.as_deref().unwrap().contains("judge_made_up"));
}

#[tokio::test]
async fn test_redispatch_retries_only_failed_rows() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let dataset_id = store.insert_dataset(qa_rows(6));
    let model_id = store.insert_model(echo_model());
    let experiment_id = store.insert_experiment(dataset_id, Some(model_id), &["exact_match"]);

    // First run: two rows fail.
    let provider = EchoProvider::new().failing(&["q1", "q4"]);
    let ctx = context(store.clone(), queue.clone(), Arc::new(provider), 3);
    ctx.dispatcher().dispatch(experiment_id).await.unwrap();
    run_to_finished(ctx, &store, experiment_id).await;

    let experiment = store.get_experiment(experiment_id).await.unwrap().unwrap();
    assert_eq!(experiment.counters.num_success, 4);

    // Reopen (an external patch operation) and dispatch again with a
    // healthy provider.
    store.reset_to_pending(experiment_id);
    let healthy = Arc::new(EchoProvider::new());
    let ctx = context(store.clone(), queue.clone(), healthy.clone(), 3);
    ctx.dispatcher().dispatch(experiment_id).await.unwrap();

    // Only the two failed rows are re-attempted.
    assert_eq!(queue.len().await.unwrap(), 2);
    run_to_finished(ctx, &store, experiment_id).await;

    let experiment = store.get_experiment(experiment_id).await.unwrap().unwrap();
    assert_eq!(experiment.counters.num_try, 6);
    assert_eq!(experiment.counters.num_success, 6);

    let answer = store.get_answer(experiment_id, 1).await.unwrap().unwrap();
    assert_eq!(answer.answer.as_deref(), Some("echo:q1"));
    assert!(answer.error_msg.is_none());
}

#[tokio::test]
async fn test_recover_requeues_inflight_deliveries() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let dataset_id = store.insert_dataset(qa_rows(1));
    let model_id = store.insert_model(echo_model());
    let experiment_id = store.insert_experiment(dataset_id, Some(model_id), &["exact_match"]);

    let ctx = context(
        store.clone(),
        queue.clone(),
        Arc::new(EchoProvider::new()),
        2,
    );
    ctx.dispatcher().dispatch(experiment_id).await.unwrap();

    // Simulate a worker crash: dequeue without ever acknowledging.
    let envelope = queue
        .dequeue(Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(queue.len().await.unwrap(), 0);

    // Pool startup recovers the stranded delivery and the flow completes.
    run_to_finished(ctx, &store, experiment_id).await;

    let answer = store
        .get_answer(experiment_id, envelope.task.row_index())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer.answer.as_deref(), Some("echo:q0"));
}
