use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ctsync_core::RunRequest;
use ctsync_storage::{connect_pool, run_migrations};
use ctsync_sync::{
    build_pipeline_from_env, connect_pg_stores, export_filesystem, load_default_conditions, maybe_build_scheduler,
    SyncConfig, TEST_CONDITION, TEST_MAX_RECORDS,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ctsync-cli")]
#[command(about = "Clinical trial registry ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, diff and store trials for one condition or every configured one
    Crawl(CrawlArgs),
    Migrate,
    /// Serve the HTTP API
    Serve,
    /// Run the cron scheduler in the foreground until interrupted
    Schedule,
    /// Write the recruiting trials of a condition as markdown files
    Export {
        #[arg(long)]
        condition: String,
        #[arg(long, default_value = "./export")]
        out: PathBuf,
    },
}

#[derive(Debug, Default, Args)]
struct CrawlArgs {
    #[arg(long)]
    condition: Option<String>,
    #[arg(long, default_value_t = 50)]
    max: usize,
    /// Single small crawl of the test condition
    #[arg(long)]
    test: bool,
    #[arg(long)]
    enrich: bool,
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command.unwrap_or(Commands::Crawl(CrawlArgs::default_for_cli())) {
        Commands::Crawl(args) => crawl(args).await?,
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let pool = connect_pool(&config.database_url)
                .await
                .context("connecting to postgres")?;
            run_migrations(&pool).await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => ctsync_web::serve_from_env().await?,
        Commands::Schedule => schedule().await?,
        Commands::Export { condition, out } => {
            let config = SyncConfig::from_env();
            let (trials, _) = connect_pg_stores(&config).await?;
            let written = export_filesystem(trials.as_ref(), &condition, &out).await?;
            println!("exported {written} trial documents to {}", out.display());
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

impl CrawlArgs {
    fn default_for_cli() -> Self {
        Self {
            max: 50,
            ..Default::default()
        }
    }
}

async fn crawl(args: CrawlArgs) -> Result<()> {
    let config = SyncConfig::from_env();
    let (conditions, max) = if args.test {
        (vec![TEST_CONDITION.to_string()], TEST_MAX_RECORDS)
    } else if let Some(condition) = args.condition {
        (vec![condition], args.max)
    } else {
        (load_default_conditions(&config.workspace_root).await?, args.max)
    };
    if conditions.is_empty() {
        bail!("no conditions to crawl");
    }

    let template = RunRequest::new("")
        .with_max_records(max)
        .with_enrichment(args.enrich)
        .with_force_refresh(args.force);
    let pipeline = build_pipeline_from_env(&config).await?;
    let runs = pipeline.run_many(&conditions, &template).await;

    let mut failed = 0;
    for run in &runs {
        match &run.result {
            Ok(stats) => println!(
                "{}: fetched={} new={} updated={} skipped={} errors={}",
                run.condition,
                stats.total_fetched,
                stats.new_trials,
                stats.updated_trials,
                stats.skipped_trials,
                stats.error_count
            ),
            Err(err) => {
                failed += 1;
                println!("{}: failed: {err}", run.condition);
            }
        }
    }
    if failed == runs.len() {
        bail!("every crawl run failed");
    }
    Ok(())
}

async fn schedule() -> Result<()> {
    let mut config = SyncConfig::from_env();
    config.scheduler_enabled = true;
    let conditions = load_default_conditions(&config.workspace_root).await?;
    let pipeline = Arc::new(build_pipeline_from_env(&config).await?);

    let Some(mut sched) = maybe_build_scheduler(&config, pipeline, conditions, RunRequest::new("")).await? else {
        bail!("scheduler was not built");
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
