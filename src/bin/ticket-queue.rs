//! Command-line entry point for the ticket job queue.
//!
//! Usage:
//!   ticket-queue migrate --database-url postgresql://localhost/ticket_queue
//!   ticket-queue stats --queue tickets
//!   ticket-queue run --config ticket-queue.toml

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::{process, sync::Arc};
use ticket_queue::{
    BrokerConnection, DatabaseQueue, JobQueue, StatsReporter, TicketHandlers, TicketQueueConfig,
    TicketQueueRuntime, broker::Broker,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "ticket-queue",
    version,
    about = "Ticket notification and SLA escalation job queue"
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "TOML configuration file")]
    config: Option<String>,

    #[arg(
        long = "database-url",
        global = true,
        value_name = "URL",
        help = "Broker connection URL (overrides the configuration)"
    )]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Create the job table and indexes")]
    Migrate,

    #[command(about = "Print job counts for a queue")]
    Stats {
        #[arg(long, help = "Queue name (defaults to the configured queue)")]
        queue: Option<String>,
    },

    #[command(about = "Run the worker and admin endpoints until Ctrl-C")]
    Run,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    };

    init_logging(&config);

    let result = match cli.command {
        Command::Migrate => migrate(&config).await,
        Command::Stats { queue } => stats(&config, queue).await,
        Command::Run => run(&config).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<TicketQueueConfig> {
    let mut config = match &cli.config {
        Some(path) => TicketQueueConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => TicketQueueConfig::from_env()?,
    };

    if let Some(url) = &cli.database_url {
        config = config.with_broker_url(url);
    }
    Ok(config)
}

fn init_logging(config: &TicketQueueConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn connect(config: &TicketQueueConfig) -> anyhow::Result<Arc<BrokerConnection<sqlx::Postgres>>> {
    let broker = BrokerConnection::connect(&config.broker)
        .await
        .with_context(|| format!("cannot reach broker at {}", config.broker.display_target()))?;
    Ok(Arc::new(broker))
}

async fn migrate(config: &TicketQueueConfig) -> anyhow::Result<()> {
    let broker = connect(config).await?;
    let queue = JobQueue::new(Arc::clone(&broker), config.worker.queue_name.clone());

    let result = queue.create_tables().await;
    broker.close().await?;
    result?;

    println!("Job table is ready");
    Ok(())
}

async fn stats(config: &TicketQueueConfig, queue_name: Option<String>) -> anyhow::Result<()> {
    let broker = connect(config).await?;
    let queue = Arc::new(JobQueue::new(
        Arc::clone(&broker),
        config.worker.queue_name.clone(),
    ));
    let reporter = StatsReporter::new(queue);

    let name = queue_name.unwrap_or_else(|| config.worker.queue_name.clone());
    let result = reporter.get_stats(&name).await;
    broker.close().await?;
    let stats = result?;

    println!("Queue: {}", stats.queue_name);
    println!("  waiting:   {}", stats.counts.waiting);
    println!("  delayed:   {}", stats.counts.delayed);
    println!("  active:    {}", stats.counts.active);
    println!("  completed: {}", stats.counts.completed);
    println!("  failed:    {}", stats.counts.failed);
    Ok(())
}

async fn run(config: &TicketQueueConfig) -> anyhow::Result<()> {
    let runtime = TicketQueueRuntime::connect(config, TicketHandlers::logging()).await?;

    #[cfg(feature = "admin")]
    let admin = if config.admin.enabled {
        match ticket_queue::admin::serve(
            Arc::new(runtime.stats().clone()),
            config.admin.bind_address,
        ) {
            Ok(server) => Some(server),
            Err(e) => {
                runtime.shutdown().await?;
                return Err(e.into());
            }
        }
    } else {
        None
    };

    info!(
        "Processing queue {}; press Ctrl-C to stop",
        runtime.queue().name()
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    #[cfg(feature = "admin")]
    if let Some(admin) = admin {
        admin.shutdown().await;
    }

    runtime.shutdown().await?;
    Ok(())
}
