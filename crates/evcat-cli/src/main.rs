use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use evcat_dates::{DateInput, DateResolver};
use evcat_storage::{EventStore, PgEventStore};
use evcat_sync::{report_daily_markdown, SyncConfig, SyncPipeline};
use evcat_validate::{CandidateValidator, ValidatorRules, Verdict};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "evcat-cli")]
#[command(about = "Canonical event catalog command-line interface")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once and upsert the results.
    Sync,
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
    /// Create the Postgres events table.
    Migrate,
    /// Show how the candidate validator judges a title.
    CheckTitle { title: String },
    /// Resolve a listing's date text the way the pipeline does.
    ResolveDate {
        text: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        machine: Option<String>,
        /// Reference date for year inference (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Summarize recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("evcat=info".parse()?);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = evcat_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} sources={} harvested={} persisted={} (new={} updated={}) reports={}",
                summary.run_id,
                summary.enabled_sources,
                summary.harvested,
                summary.persisted,
                summary.inserted,
                summary.updated,
                summary.reports_dir
            );
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %pipeline.config().sync_cron_1,
                cron_2 = %pipeline.config().sync_cron_2,
                "scheduler running; ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let Some(url) = config.database_url.as_deref() else {
                bail!("set EVCAT_DATABASE_URL or DATABASE_URL to migrate");
            };
            let store = PgEventStore::connect(url).await?;
            println!("events table ready: {} events stored", store.count().await?);
        }
        Commands::CheckTitle { title } => {
            let config = SyncConfig::from_env();
            let rules = ValidatorRules::from_optional_yaml_file(
                config.workspace_root.join("rules").join("denylist.yaml"),
            )?;
            match CandidateValidator::new(rules).check(&title) {
                Verdict::Accept => println!("accept"),
                Verdict::Reject(reason) => println!("reject: {} ({reason:?})", reason.label()),
            }
        }
        Commands::ResolveDate {
            text,
            url,
            machine,
            today,
        } => {
            let resolver = today.map(DateResolver::new).unwrap_or_else(DateResolver::from_clock);
            let input = DateInput {
                text: text.as_deref(),
                url: url.as_deref(),
                machine: machine.as_deref(),
            };
            match resolver.resolve(&input) {
                Some(resolved) => {
                    let time = resolved
                        .date
                        .time
                        .map(|t| t.format("%H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{} {} via {:?}", resolved.date.iso_day(), time, resolved.rule);
                }
                None => println!("unresolved"),
            }
        }
        Commands::Report { runs, reports_dir } => {
            let reports_dir = reports_dir.or_else(|| Some(SyncConfig::from_env().reports_dir));
            println!("{}", report_daily_markdown(runs, reports_dir)?);
        }
    }

    Ok(())
}
