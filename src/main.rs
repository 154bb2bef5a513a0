use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use judgeworks::config::{Config, LoggingConfig};
use judgeworks::coordinator::client::BatchFile;
use judgeworks::coordinator::{ClientConfig, CoordinatorServer, RpcClient};
use judgeworks::scheduler::PolicyRegistry;
use judgeworks::worker::{ExecutorRegistry, WorkerClient, CPU_EXEC_CAPABILITY};

#[derive(Parser)]
#[command(
    name = "judgeworks",
    version,
    about = "Coordinator and worker daemon for distributed contest judging",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "JUDGEWORKS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator
    Serve {
        /// Port workers connect to
        #[arg(long)]
        worker_port: Option<u16>,

        /// Port of the RPC front door
        #[arg(long)]
        rpc_port: Option<u16>,

        /// SQLite database file
        #[arg(long)]
        database: Option<PathBuf>,

        /// Scheduling policy (see `judgeworks policies`)
        #[arg(long)]
        scheduler: Option<String>,

        /// Requeues allowed per job after worker loss
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Run a worker connected to a coordinator
    Worker {
        /// Coordinator host
        host: Option<String>,

        /// Coordinator worker port
        #[arg(short, long)]
        port: Option<u16>,

        /// Worker name (defaults to the host name)
        #[arg(short, long)]
        name: Option<String>,

        /// Jobs run at once
        #[arg(long)]
        concurrency: Option<u32>,

        /// Capability to announce (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Announce the cpu-exec capability
        #[arg(long)]
        can_run_cpu_exec: bool,
    },

    /// Submit a batch file to a coordinator
    Submit {
        /// JSON file: an array of job specs or {"jobs": [...]}
        file: PathBuf,

        /// Coordinator RPC URL
        #[arg(long, default_value = "http://127.0.0.1:7889")]
        url: String,

        /// Wait for the batch report
        #[arg(short, long)]
        wait: bool,
    },

    /// List available scheduling policies
    Policies,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }

    // Initialize tracing/logging
    setup_tracing(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Serve {
            worker_port,
            rpc_port,
            database,
            scheduler,
            max_retries,
        } => {
            let coordinator = &mut config.coordinator;
            if let Some(port) = worker_port {
                coordinator.worker_listen.set_port(port);
            }
            if let Some(port) = rpc_port {
                coordinator.rpc_listen.set_port(port);
            }
            if let Some(path) = database {
                coordinator.database_path = path;
            }
            if let Some(name) = scheduler {
                coordinator.scheduler = name;
            }
            if let Some(retries) = max_retries {
                coordinator.max_retries = retries;
            }
            config.validate()?;
            serve(config).await?;
        }

        Commands::Worker {
            host,
            port,
            name,
            concurrency,
            capabilities,
            can_run_cpu_exec,
        } => {
            let worker = &mut config.worker;
            if let Some(host) = host {
                worker.coordinator = host;
            }
            if let Some(port) = port {
                worker.port = port;
            }
            if let Some(name) = name {
                worker.name = name;
            }
            if let Some(concurrency) = concurrency {
                worker.concurrency = concurrency;
            }
            worker.capabilities.extend(capabilities);
            if can_run_cpu_exec {
                worker.capabilities.insert(CPU_EXEC_CAPABILITY.to_string());
            }
            config.validate()?;
            run_worker(config).await?;
        }

        Commands::Submit { file, url, wait } => {
            submit(file, url, wait).await?;
        }

        Commands::Policies => {
            for name in PolicyRegistry::with_defaults().names() {
                println!("{name}");
            }
        }
    }

    Ok(())
}

fn setup_tracing(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            tracing_subscriber::EnvFilter::new("judgeworks=debug,info")
        } else {
            tracing_subscriber::EnvFilter::new(format!("judgeworks={},warn", logging.level))
        }
    });

    match logging.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    judgeworks::metrics::init_metrics()
        .map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {e}"))?;

    let server = CoordinatorServer::new(config.coordinator).context("Failed to start coordinator")?;
    let info = server.info();
    tracing::info!(
        worker_listen = %info.worker_listen,
        rpc_listen = %info.rpc_listen,
        scheduler = %info.scheduler,
        recovered_jobs = info.recovered_jobs,
        "Starting coordinator"
    );
    println!("{}", info.display());

    server.run_until(shutdown_signal()).await?;
    Ok(())
}

async fn run_worker(config: Config) -> Result<()> {
    let executors = ExecutorRegistry::builtin();
    tracing::info!(
        coordinator = %config.worker.address(),
        name = %config.worker.name,
        concurrency = config.worker.concurrency,
        capabilities = ?config.worker.capabilities,
        executors = ?executors.kinds(),
        "Starting worker"
    );

    let client = WorkerClient::new(config.worker, executors)?;
    client.run_until(shutdown_signal()).await;
    Ok(())
}

async fn submit(file: PathBuf, url: String, wait: bool) -> Result<()> {
    let raw = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read batch file: {}", file.display()))?;
    let jobs = serde_json::from_str::<BatchFile>(&raw)
        .with_context(|| format!("Failed to parse batch file: {}", file.display()))?
        .into_jobs();

    let client = RpcClient::new(ClientConfig::new(url))?;
    tracing::info!(jobs = jobs.len(), wait, "Submitting batch");

    if wait {
        let report = client.submit_and_wait(jobs).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let batch_id = client.submit(jobs).await?;
        println!("{batch_id}");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
