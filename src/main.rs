//! # labelops operator CLI
//!
//! Inspects and maintains the job ledger. Executing jobs needs a
//! `RemoteApi` implementation, which the embedding application provides
//! through `labelops::engine::Engine`.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use labelops::{
    config::{AppConfig, ConfigLoader},
    db::{health_check, init_pool, run_migrations},
    ledger::ItemLedger,
    models::{ItemStatus, JobStatus},
    orchestrator::STALE_JOB_MESSAGE,
    telemetry::init_tracing,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "labelops", about = "Bulk tag-driven mutation job ledger")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Mark jobs left `running` by a stopped process as failed
    Recover,
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    AutoQueue {
        #[command(subcommand)]
        command: AutoQueueCommand,
    },
    /// Print the effective configuration with secrets redacted
    Config,
}

#[derive(Debug, Subcommand)]
enum JobsCommand {
    List {
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    Status {
        id: i32,
    },
    /// Export failed or skipped items as JSON lines
    Items {
        id: i32,
        #[arg(long, value_enum, default_value_t = ItemFilter::Failed)]
        status: ItemFilter,
    },
    Delete {
        id: i32,
    },
}

#[derive(Debug, Subcommand)]
enum AutoQueueCommand {
    On,
    Off,
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ItemFilter {
    Failed,
    Skipped,
}

impl From<ItemFilter> for ItemStatus {
    fn from(filter: ItemFilter) -> Self {
        match filter {
            ItemFilter::Failed => ItemStatus::Failed,
            ItemFilter::Skipped => ItemStatus::Skipped,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;
    init_tracing(&config).context("failed to initialize tracing")?;

    match cli.command {
        Command::Config => println!("{}", config.redacted_json()?),
        Command::Migrate => {
            let db = connect(&config).await?;
            run_migrations(&db).await?;
            println!("migrations applied");
        }
        Command::Recover => {
            let db = connect(&config).await?;
            let recovered = ledger(&config, db).fail_stale_jobs(STALE_JOB_MESSAGE, |_| false).await?;
            info!(recovered, "Stale job recovery finished");
            println!("{recovered} stale job(s) marked failed");
        }
        Command::Jobs { command } => {
            let db = connect(&config).await?;
            jobs(ledger(&config, db), command).await?;
        }
        Command::AutoQueue { command } => {
            let db = connect(&config).await?;
            let ledger = ledger(&config, db);
            match command {
                AutoQueueCommand::On => ledger.set_auto_queue(true).await?,
                AutoQueueCommand::Off => ledger.set_auto_queue(false).await?,
                AutoQueueCommand::Status => {}
            }
            let enabled = ledger.auto_queue_enabled().await?;
            println!("auto-queue {}", if enabled { "on" } else { "off" });
        }
    }
    Ok(())
}

async fn connect(config: &AppConfig) -> Result<sea_orm::DatabaseConnection> {
    let db = init_pool(config).await?;
    health_check(&db).await?;
    Ok(db)
}

fn ledger(config: &AppConfig, db: sea_orm::DatabaseConnection) -> ItemLedger {
    ItemLedger::new(db, config.ledger.write_batch_size)
}

async fn jobs(ledger: ItemLedger, command: JobsCommand) -> Result<()> {
    match command {
        JobsCommand::List { limit } => {
            for job in ledger.list_jobs(limit).await? {
                println!(
                    "{:>6}  {:<10} {:<14} total={} ok={} failed={} skipped={} pending={}{}",
                    job.id,
                    job.status.as_str(),
                    job.variant,
                    job.total_items,
                    job.successful_items,
                    job.failed_items,
                    job.skipped_items,
                    job.pending_items(),
                    if job.is_repair { " repair" } else { "" },
                );
            }
        }
        JobsCommand::Status { id } => {
            let report = ledger
                .job_status(id)
                .await
                .with_context(|| format!("failed to load job {id}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        JobsCommand::Items { id, status } => {
            for item in ledger.list_items(id, Some(status.into())).await? {
                println!(
                    "{}",
                    serde_json::json!({
                        "item_id": item.id,
                        "account_id": item.account_id,
                        "parent_id": item.parent_id,
                        "parent_name": item.parent_name,
                        "campaign_name": item.campaign_name,
                        "variant": item.variant,
                        "status": item.status.as_str(),
                        "message": item.error_message,
                    })
                );
            }
        }
        JobsCommand::Delete { id } => {
            let job = ledger.get_job(id).await?;
            if job.status == JobStatus::Running {
                bail!("job {id} is running; pause it or run `labelops recover` first");
            }
            let removed = ledger.delete_job(id).await?;
            println!("deleted job {id} and {removed} item(s)");
        }
    }
    Ok(())
}
