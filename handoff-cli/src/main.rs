//! handoff CLI - worker and client for the handoff task queue.
//!
//! # Commands
//!
//! - `handoff worker` - Process tasks from Redis with the mock model
//! - `handoff submit <payload>` - Submit a task, print its id
//! - `handoff status <id>` - Print a task's status
//! - `handoff result <id>` - Print a task's result (exit code tells why not)
//! - `handoff run <payload>` - Run the mock model inline, no queue
//! - `handoff sweep` - Apply the TTL to status/result keys without expiry
//! - `handoff health` - Print a JSON health report

use clap::{Args, Parser, Subcommand};
use handoff_log::{Level, info};
use handoff_queue::{
    QueueConfig, RedisTransport, TaskId, TaskOutcome, TaskQueue, WorkerConfig, WorkerPool,
    execute_sync,
};
use handoff_redis::RedisConfig;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

mod error;
mod mock;

use error::{CliError, CliResult};
use mock::MockModel;

/// handoff - asynchronous task handoff over Redis Streams
#[derive(Parser)]
#[command(name = "handoff")]
#[command(author = "Pegasus Heavy Industries LLC")]
#[command(version)]
#[command(about = "Worker and client for the handoff task queue")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Redis URL
    #[arg(long, global = true, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Key namespace of the queue
    #[arg(long, global = true, env = "HANDOFF_NAMESPACE")]
    namespace: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Process tasks until interrupted
    #[command(alias = "w")]
    Worker(WorkerArgs),

    /// Submit a task
    Submit(SubmitArgs),

    /// Show the status of a task
    Status {
        /// Task id
        task_id: String,
    },

    /// Show the result of a task
    Result {
        /// Task id
        task_id: String,
    },

    /// Run the mock model inline without the queue
    Run {
        /// Input passed to the model
        payload: String,

        #[command(flatten)]
        model: ModelArgs,

        /// Execution timeout in seconds
        #[arg(long, env = "PREDICTION_TIMEOUT", default_value = "30")]
        timeout: f64,
    },

    /// Give status and result keys without expiry the configured TTL
    Sweep,

    /// Print a health report
    Health,
}

#[derive(Args)]
struct ModelArgs {
    /// Minimum simulated processing time in seconds
    #[arg(long, default_value = "10")]
    min_delay: f64,

    /// Maximum simulated processing time in seconds
    #[arg(long, default_value = "17")]
    max_delay: f64,

    /// Probability that a simulated run fails
    #[arg(long, default_value = "0.05")]
    failure_rate: f64,
}

#[derive(Args)]
struct WorkerArgs {
    /// Number of concurrent worker loops
    #[arg(short, long, env = "WORKER_CONCURRENCY", default_value = "1")]
    concurrency: usize,

    /// Per-task timeout in seconds
    #[arg(long, env = "PREDICTION_TIMEOUT", default_value = "30")]
    timeout: f64,

    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args)]
struct SubmitArgs {
    /// Input for the work function
    payload: String,

    /// Task id; a random UUID when omitted
    #[arg(long)]
    id: Option<String>,

    /// Longest accepted payload in bytes
    #[arg(long, env = "MAX_INPUT_LENGTH", default_value = "10000")]
    max_input_length: usize,
}

fn seconds(what: &str, secs: f64) -> CliResult<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| CliError::InvalidArgument(format!("{} {}: {}", what, secs, e)))
}

impl ModelArgs {
    fn model(&self) -> CliResult<MockModel> {
        MockModel::new(
            seconds("min delay", self.min_delay)?,
            seconds("max delay", self.max_delay)?,
            self.failure_rate,
        )
        .map_err(CliError::InvalidArgument)
    }
}

impl Cli {
    fn queue_config(&self) -> CliResult<QueueConfig> {
        let namespace = self.namespace.clone();
        Ok(QueueConfig::from_lookup(|key| match key {
            "HANDOFF_NAMESPACE" => namespace.clone(),
            _ => std::env::var(key).ok(),
        })?)
    }

    fn redis_config(&self) -> RedisConfig {
        let mut builder = RedisConfig::from_env();
        if let Some(url) = &self.redis_url {
            builder = builder.url(url.clone());
        }
        builder.build()
    }

    async fn connect(&self) -> CliResult<Arc<TaskQueue>> {
        let transport = Arc::new(RedisTransport::new(self.redis_config())?);
        let queue = TaskQueue::connect(transport, self.queue_config()?).await?;
        Ok(Arc::new(queue))
    }
}

fn print_json(value: &serde_json::Value) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn worker(cli: &Cli, args: &WorkerArgs) -> CliResult<()> {
    let work = args.model.model()?.into_work_fn();
    let config = WorkerConfig::default()
        .with_concurrency(args.concurrency)
        .with_job_timeout(seconds("timeout", args.timeout)?);

    let queue = cli.connect().await?;
    let pool = WorkerPool::spawn(queue.clone(), work, config);
    info!("Workers running as {}", pool.consumers().join(", "));

    tokio::signal::ctrl_c().await?;

    info!("Interrupted, finishing current tasks");
    let stats = pool.stats();
    pool.shutdown().await;
    queue.shutdown().await?;

    let snapshot = stats.snapshot();
    print_json(&json!({
        "completed": snapshot.completed,
        "failed": snapshot.failed,
        "skipped": snapshot.skipped,
        "average_processing_secs": snapshot.average_processing_time().as_secs_f64(),
    }))
}

async fn submit(cli: &Cli, args: &SubmitArgs) -> CliResult<()> {
    if args.payload.is_empty() {
        return Err(CliError::InvalidArgument("payload must not be empty".to_string()));
    }
    if args.payload.len() > args.max_input_length {
        return Err(CliError::InvalidArgument(format!(
            "payload is {} bytes, the limit is {}",
            args.payload.len(),
            args.max_input_length
        )));
    }
    let task_id = match &args.id {
        Some(id) => TaskId::new(id.clone())?,
        None => TaskId::generate(),
    };

    let queue = cli.connect().await?;
    let entry_id = queue.try_submit(task_id.as_str(), &args.payload).await?;
    queue.shutdown().await?;

    print_json(&json!({
        "task_id": task_id,
        "entry_id": entry_id,
        "status": "pending",
    }))
}

async fn status(cli: &Cli, task_id: &str) -> CliResult<()> {
    let queue = cli.connect().await?;
    let status = queue.try_get_status(task_id).await?;
    queue.shutdown().await?;

    match status {
        Some(status) => print_json(&json!({ "task_id": task_id, "status": status })),
        None => Err(CliError::NotFound(task_id.to_string())),
    }
}

async fn result(cli: &Cli, task_id: &str) -> CliResult<()> {
    let queue = cli.connect().await?;
    let outcome = queue.try_poll(task_id).await?;
    queue.shutdown().await?;
    outcome_to_output(task_id, outcome)
}

fn outcome_to_output(task_id: &str, outcome: TaskOutcome) -> CliResult<()> {
    match outcome {
        TaskOutcome::Completed(result) => {
            // Results the work function wrote as JSON print as JSON
            let result = serde_json::from_str(&result).unwrap_or(serde_json::Value::String(result));
            print_json(&json!({ "task_id": task_id, "status": "completed", "result": result }))
        }
        TaskOutcome::Unknown => Err(CliError::NotFound(task_id.to_string())),
        TaskOutcome::Pending | TaskOutcome::Processing => {
            Err(CliError::StillProcessing(task_id.to_string()))
        }
        TaskOutcome::Failed => Err(CliError::TaskFailed(task_id.to_string())),
        TaskOutcome::ResultUnavailable => Err(CliError::ResultUnavailable(task_id.to_string())),
    }
}

async fn run_inline(payload: &str, model: &ModelArgs, timeout: f64) -> CliResult<()> {
    let work = model.model()?.into_work_fn();
    let result = execute_sync(&work, payload, seconds("timeout", timeout)?).await?;
    let result = serde_json::from_str(&result).unwrap_or(serde_json::Value::String(result));
    print_json(&result)
}

async fn sweep(cli: &Cli) -> CliResult<()> {
    let queue = cli.connect().await?;
    let fixed = queue.sweep_expiries().await?;
    queue.shutdown().await?;
    print_json(&json!({ "fixed": fixed }))
}

async fn health(cli: &Cli) -> CliResult<()> {
    let queue = cli.connect().await?;
    let report = queue.health_report().await;
    queue.shutdown().await?;

    print_json(&serde_json::to_value(&report)?)?;
    if report.transport_alive {
        Ok(())
    } else {
        Err(CliError::Unhealthy)
    }
}

async fn dispatch(cli: &Cli) -> CliResult<()> {
    match &cli.command {
        Commands::Worker(args) => worker(cli, args).await,
        Commands::Submit(args) => submit(cli, args).await,
        Commands::Status { task_id } => status(cli, task_id).await,
        Commands::Result { task_id } => result(cli, task_id).await,
        Commands::Run {
            payload,
            model,
            timeout,
        } => run_inline(payload, model, *timeout).await,
        Commands::Sweep => sweep(cli).await,
        Commands::Health => health(cli).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.quiet {
        handoff_log::set_level(Level::Error);
    } else if cli.verbose {
        handoff_log::set_debug(true);
    }
    handoff_log::init();

    if let Err(e) = dispatch(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
