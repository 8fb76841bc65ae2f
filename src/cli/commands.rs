//! CLI command definitions for matchcast.
//!
//! Wires configuration, storage, the Redis queue, and the generation
//! pipeline together behind a small set of operational commands.

use std::sync::Arc;

use clap::Parser;
use redis::aio::ConnectionManager;
use tracing::{info, warn};

use crate::alerts::{sink_from_config, AlertSink};
use crate::budget::BudgetTracker;
use crate::cache::ReadThroughCache;
use crate::config::PipelineConfig;
use crate::health::ModelHealthTracker;
use crate::monitor::{CompletenessMonitor, WorkerHealthMonitor};
use crate::orchestrator::GenerationOrchestrator;
use crate::providers::ProviderRecord;
use crate::scheduler::{
    CircuitBreaker, Job, JobExecutors, JobKind, JobQueue, QueueControl, QueueInspect, WorkerPool,
    WorkerPoolConfig,
};
use crate::server::{AppState, STATUS_CACHE_TTL};
use crate::storage::{Database, Store};

/// Sports fixture forecast generation pipeline.
#[derive(Parser)]
#[command(name = "matchcast")]
#[command(about = "Generate LLM match forecasts for upcoming fixtures")]
#[command(version)]
#[command(
    long_about = "matchcast batches upcoming fixtures into shared prompts, fans them out to \
configured LLM providers, and persists the resulting forecasts.\n\nThe pipeline runs either \
inline (`matchcast run`), as queue workers (`matchcast worker`), or behind the HTTP trigger \
server (`matchcast serve`)."
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start the HTTP trigger server.
    Serve,

    /// Run one generation pass inline and print the summary.
    Run(RunArgs),

    /// Start queue workers and process jobs until interrupted.
    Worker(WorkerArgs),

    /// Enqueue a job onto the generation queue.
    Enqueue(EnqueueArgs),

    /// Register or update a forecast provider.
    RegisterProvider(RegisterProviderArgs),

    /// Check worker liveness and stalled jobs.
    HealthCheck(HealthCheckArgs),

    /// Check finished fixtures for missing predictions.
    CompletenessCheck(HealthCheckArgs),
}

/// Arguments for `matchcast run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Fixture ids to generate for; all ready fixtures when omitted.
    pub fixture_ids: Vec<String>,

    /// Print the run summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `matchcast worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of workers; overrides MATCHCAST_NUM_WORKERS.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,
}

/// Job kinds that can be enqueued from the CLI.
#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum EnqueueKind {
    /// Full generation pass over ready fixtures.
    Generate,
    /// Worker liveness check.
    WorkerHealth,
    /// Prediction completeness scan.
    Completeness,
}

/// Arguments for `matchcast enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Kind of job to enqueue.
    #[arg(value_enum, default_value = "generate")]
    pub kind: EnqueueKind,

    /// Fixture ids for a generate job; all ready fixtures when omitted.
    #[arg(long = "fixture", value_name = "ID")]
    pub fixture_ids: Vec<String>,
}

/// Arguments for `matchcast register-provider`.
#[derive(Parser, Debug)]
pub struct RegisterProviderArgs {
    /// Stable provider slug, e.g. "openrouter-kimi".
    #[arg(long)]
    pub id: String,

    /// Human-readable name; defaults to the id.
    #[arg(long)]
    pub display_name: Option<String>,

    /// Model identifier passed to the vendor endpoint.
    #[arg(short = 'm', long)]
    pub model: String,

    /// OpenAI-compatible chat completions base URL.
    #[arg(long)]
    pub base_url: String,

    /// Environment variable holding the provider's API key.
    #[arg(long)]
    pub api_key_env: String,

    /// Register the provider in a disabled state.
    #[arg(long)]
    pub inactive: bool,

    /// Cost per one million input tokens, in dollars.
    #[arg(long)]
    pub cost_per_1m_input: f64,

    /// Cost per one million output tokens, in dollars.
    #[arg(long)]
    pub cost_per_1m_output: f64,
}

/// Arguments for the monitor check commands.
#[derive(Parser, Debug)]
pub struct HealthCheckArgs {
    /// Print the check result as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before
/// running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;

    match cli.command {
        Commands::Serve => run_serve_command(config).await?,
        Commands::Run(args) => run_generate_command(config, args).await?,
        Commands::Worker(args) => run_worker_command(config, args).await?,
        Commands::Enqueue(args) => run_enqueue_command(config, args).await?,
        Commands::RegisterProvider(args) => run_register_provider_command(config, args).await?,
        Commands::HealthCheck(args) => run_health_check_command(config, args).await?,
        Commands::CompletenessCheck(args) => run_completeness_command(config, args).await?,
    }
    Ok(())
}

/// Shared runtime wiring used by every command.
struct AppContext {
    config: PipelineConfig,
    store: Arc<dyn Store>,
    budget: Arc<BudgetTracker>,
    orchestrator: Arc<GenerationOrchestrator>,
    queue: Arc<JobQueue>,
    redis: ConnectionManager,
    alerts: Arc<dyn AlertSink>,
}

impl AppContext {
    /// Connects storage and Redis and builds the pipeline components.
    async fn build(config: PipelineConfig) -> anyhow::Result<Self> {
        let database = Database::connect(&config.database_url).await?;
        database.run_migrations().await?;
        let store: Arc<dyn Store> = Arc::new(database);

        let redis_client = redis::Client::open(config.redis_url.as_str())?;
        let redis = ConnectionManager::new(redis_client).await?;
        let queue = Arc::new(JobQueue::from_connection(
            redis.clone(),
            &config.queue_name,
        ));

        let budget = Arc::new(BudgetTracker::new(config.daily_budget));
        match store.budget_spent_today().await {
            Ok(spent) => budget.seed(spent),
            Err(e) => warn!(error = %e, "Could not seed budget from ledger; starting at zero"),
        }

        let health = Arc::new(ModelHealthTracker::new(config.auto_disable_threshold));
        let orchestrator = Arc::new(GenerationOrchestrator::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&budget),
            Arc::clone(&health),
        ));

        let alerts = sink_from_config(config.alert_webhook_url.as_deref());

        Ok(Self {
            config,
            store,
            budget,
            orchestrator,
            queue,
            redis,
            alerts,
        })
    }

    fn worker_health_monitor(&self) -> WorkerHealthMonitor {
        WorkerHealthMonitor::new(
            Arc::clone(&self.queue) as Arc<dyn QueueInspect>,
            self.config.stall_threshold,
            Arc::clone(&self.alerts),
        )
    }

    fn completeness_monitor(&self) -> CompletenessMonitor {
        CompletenessMonitor::new(
            Arc::clone(&self.store),
            self.config.completeness_window,
            self.config.alert_sample_size,
            Arc::clone(&self.alerts),
        )
    }

    fn circuit_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.config.circuit_threshold,
            self.config.circuit_cooldown,
            Arc::clone(&self.queue) as Arc<dyn QueueControl>,
            Arc::clone(&self.alerts),
        )
    }
}

async fn run_serve_command(config: PipelineConfig) -> anyhow::Result<()> {
    let ctx = AppContext::build(config).await?;
    let cache = Arc::new(ReadThroughCache::new(ctx.redis.clone(), STATUS_CACHE_TTL));

    let state = Arc::new(AppState {
        config: ctx.config.clone(),
        orchestrator: Arc::clone(&ctx.orchestrator),
        store: Arc::clone(&ctx.store),
        budget: Arc::clone(&ctx.budget),
        queue: Arc::clone(&ctx.queue),
        cache,
    });

    crate::server::serve(state).await
}

async fn run_generate_command(config: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    let ctx = AppContext::build(config).await?;

    let summary = if args.fixture_ids.is_empty() {
        ctx.orchestrator.run().await?
    } else {
        ctx.orchestrator.run_fixture_ids(&args.fixture_ids).await?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Generated {} predictions for {} fixtures across {} providers ({} batches)",
            summary.predictions, summary.matches, summary.providers, summary.batches
        );
        println!(
            "Budget: {:.2} of {:.2} dollars spent ({:.1}%)",
            summary.budget.spent, summary.budget.daily_limit, summary.budget.percent_used
        );
        for error in &summary.errors {
            println!("  error: {}", error);
        }
    }
    Ok(())
}

async fn run_worker_command(config: PipelineConfig, args: WorkerArgs) -> anyhow::Result<()> {
    let mut config = config;
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }

    let ctx = AppContext::build(config).await?;
    let executors = JobExecutors {
        orchestrator: Arc::clone(&ctx.orchestrator),
        worker_health: Arc::new(ctx.worker_health_monitor()),
        completeness: Arc::new(ctx.completeness_monitor()),
        circuit: Arc::new(ctx.circuit_breaker()),
    };

    let pool_config = WorkerPoolConfig {
        num_workers: ctx.config.num_workers,
        job_timeout: ctx.config.job_timeout,
        ..Default::default()
    };
    let mut pool = WorkerPool::new(pool_config, Arc::clone(&ctx.queue), executors);
    pool.start().await?;

    info!(
        workers = ctx.config.num_workers,
        queue = %ctx.config.queue_name,
        "Worker pool running; press ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await?;

    info!("Shutting down worker pool");
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        processed = stats.total_processed(),
        succeeded = stats.jobs_completed,
        failed = stats.jobs_failed,
        "Worker pool stopped"
    );
    Ok(())
}

async fn run_enqueue_command(config: PipelineConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let queue = JobQueue::connect(&config.redis_url, &config.queue_name).await?;

    let job = match args.kind {
        EnqueueKind::Generate => Job::new(JobKind::Generate {
            fixture_ids: args.fixture_ids,
        }),
        EnqueueKind::WorkerHealth => Job::new(JobKind::WorkerHealthCheck),
        EnqueueKind::Completeness => Job::new(JobKind::CompletenessCheck),
    };

    let job_id = job.id;
    let label = job.kind.label().to_string();
    queue.enqueue(job).await?;
    println!("Enqueued {} job {}", label, job_id);
    Ok(())
}

async fn run_register_provider_command(
    config: PipelineConfig,
    args: RegisterProviderArgs,
) -> anyhow::Result<()> {
    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let record = ProviderRecord {
        display_name: args.display_name.unwrap_or_else(|| args.id.clone()),
        id: args.id,
        model: args.model,
        base_url: args.base_url,
        api_key_env: args.api_key_env,
        active: !args.inactive,
        auto_disabled: false,
        consecutive_failures: 0,
        cost_per_1m_input: args.cost_per_1m_input,
        cost_per_1m_output: args.cost_per_1m_output,
    };
    database.upsert_provider(&record).await?;

    println!(
        "Registered provider '{}' ({})",
        record.id,
        if record.active { "active" } else { "inactive" }
    );
    Ok(())
}

async fn run_health_check_command(
    config: PipelineConfig,
    args: HealthCheckArgs,
) -> anyhow::Result<()> {
    let ctx = AppContext::build(config).await?;
    let snapshot = ctx.worker_health_monitor().check().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!(
            "workers: {} live, {} stalled jobs, {} pending, {} processing",
            snapshot.live_workers,
            snapshot.stalled_jobs,
            snapshot.pending_jobs,
            snapshot.processing_jobs
        );
    }

    if !snapshot.healthy {
        anyhow::bail!("worker health check failed: no live workers with jobs stalled");
    }
    Ok(())
}

async fn run_completeness_command(
    config: PipelineConfig,
    args: HealthCheckArgs,
) -> anyhow::Result<()> {
    let ctx = AppContext::build(config).await?;
    let report = ctx.completeness_monitor().check().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.complete {
        println!("All finished fixtures have predictions");
    } else {
        println!(
            "{} finished fixtures missing predictions (sample: {})",
            report.missing_count,
            report.sample_ids.join(", ")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["matchcast", "run"]).expect("should parse");
        match cli.command {
            Commands::Run(args) => {
                assert!(args.fixture_ids.is_empty());
                assert!(!args.json);
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_run_command_with_fixture_ids() {
        let cli = Cli::try_parse_from(["matchcast", "run", "fx-1", "fx-2", "-j"])
            .expect("should parse");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.fixture_ids, vec!["fx-1", "fx-2"]);
                assert!(args.json);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_enqueue_defaults_to_generate() {
        let cli = Cli::try_parse_from(["matchcast", "enqueue"]).expect("should parse");
        match cli.command {
            Commands::Enqueue(args) => {
                assert!(matches!(args.kind, EnqueueKind::Generate));
                assert!(args.fixture_ids.is_empty());
            }
            _ => panic!("Expected Enqueue command"),
        }
    }

    #[test]
    fn test_enqueue_with_fixtures_and_kind() {
        let cli = Cli::try_parse_from([
            "matchcast",
            "enqueue",
            "generate",
            "--fixture",
            "fx-1",
            "--fixture",
            "fx-2",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Enqueue(args) => {
                assert_eq!(args.fixture_ids, vec!["fx-1", "fx-2"]);
            }
            _ => panic!("Expected Enqueue command"),
        }
    }

    #[test]
    fn test_register_provider_args() {
        let cli = Cli::try_parse_from([
            "matchcast",
            "register-provider",
            "--id",
            "acme",
            "--model",
            "acme-1",
            "--base-url",
            "https://api.acme.dev/v1",
            "--api-key-env",
            "ACME_API_KEY",
            "--cost-per-1m-input",
            "0.5",
            "--cost-per-1m-output",
            "1.5",
        ])
        .expect("should parse");
        match cli.command {
            Commands::RegisterProvider(args) => {
                assert_eq!(args.id, "acme");
                assert!(args.display_name.is_none());
                assert!(!args.inactive);
                assert!((args.cost_per_1m_input - 0.5).abs() < f64::EPSILON);
            }
            _ => panic!("Expected RegisterProvider command"),
        }
    }

    #[test]
    fn test_worker_count_override() {
        let cli = Cli::try_parse_from(["matchcast", "worker", "-w", "4"]).expect("should parse");
        match cli.command {
            Commands::Worker(args) => assert_eq!(args.workers, Some(4)),
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_global_log_level() {
        let cli = Cli::try_parse_from(["matchcast", "serve", "--log-level", "debug"])
            .expect("should parse");
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Serve));
    }
}
