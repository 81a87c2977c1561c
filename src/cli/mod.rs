//! CLI entry points.
//!
//! Three commands cover the runner's operational surface:
//!
//! - `run`: start the worker pool and drain the queue until interrupted
//! - `dispatch`: fire-and-forget trigger for an experiment
//! - `migrate`: apply the database schema

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::RunnerConfig;
use crate::llm::ChatClient;
use crate::metrics::MetricRegistry;
use crate::runner::{Dispatcher, RedisTaskQueue, RunnerContext, WorkerPool};
use crate::storage::Database;
use crate::tools::{HttpToolBridge, ToolBridge};

/// Distributed LLM evaluation runner.
#[derive(Debug, Parser)]
#[command(name = "evalforge", version, about)]
pub struct Cli {
    /// Log level (overridden by RUST_LOG).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the worker pool and process tasks until interrupted.
    Run {
        /// Number of concurrent workers.
        #[arg(long, env = "EVALFORGE_WORKERS")]
        workers: Option<usize>,
    },
    /// Enqueue the row tasks of an experiment.
    Dispatch {
        /// The experiment to dispatch.
        experiment_id: i64,
    },
    /// Apply database migrations.
    Migrate,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run { workers } => {
            let mut config = RunnerConfig::from_env()?;
            if let Some(workers) = workers {
                config.num_workers = workers;
            }
            config.validate()?;
            run_pool(config).await
        }
        Commands::Dispatch { experiment_id } => {
            let config = RunnerConfig::from_env()?;
            dispatch(config, experiment_id).await
        }
        Commands::Migrate => {
            let config = RunnerConfig::from_env()?;
            let database = Database::connect(&config.database_url).await?;
            database.run_migrations().await?;
            info!("Migrations applied");
            Ok(())
        }
    }
}

async fn run_pool(config: RunnerConfig) -> anyhow::Result<()> {
    let store = Arc::new(Database::connect(&config.database_url).await?);
    let queue = Arc::new(RedisTaskQueue::connect(&config.redis_url, &config.queue_name).await?);
    let provider = Arc::new(ChatClient::new(
        config.provider_timeout,
        config.provider_attempts,
        config.provider_retry_delay,
    ));

    let bridge: Option<Arc<dyn ToolBridge>> = match &config.tool_bridge_url {
        Some(url) => match HttpToolBridge::connect(url).await {
            Ok(bridge) => Some(Arc::new(bridge)),
            Err(e) => {
                // Tool-less generation still works without the bridge.
                tracing::warn!(error = %e, "Tool bridge is not responding, tools disabled");
                None
            }
        },
        None => None,
    };

    let ctx = Arc::new(RunnerContext {
        store,
        queue,
        provider,
        bridge,
        metrics: Arc::new(MetricRegistry::builtin()),
        config,
    });

    let mut pool = WorkerPool::new(ctx);
    pool.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        tasks_completed = stats.tasks_completed,
        tasks_failed = stats.tasks_failed,
        "Final pool statistics"
    );

    Ok(())
}

async fn dispatch(config: RunnerConfig, experiment_id: i64) -> anyhow::Result<()> {
    let store = Arc::new(Database::connect(&config.database_url).await?);
    let queue = Arc::new(RedisTaskQueue::connect(&config.redis_url, &config.queue_name).await?);

    let dispatcher = Dispatcher::new(store, queue);
    dispatcher.dispatch(experiment_id).await?;

    info!(experiment_id, "Experiment dispatched");
    Ok(())
}
