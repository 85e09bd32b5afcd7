use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cwv_storage::WorkbookStore;
use cwv_sync::{planner, CwvConfig, RunGuard};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cwv")]
#[command(about = "Core Web Vitals export command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize and append one batch of metrics.
    Run,
    /// Print the request plan without calling the API.
    Plan,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// Summarize recent executions from the audit tab.
    History {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let guard = RunGuard::new();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = cwv_sync::run_once_from_env(&guard).await?;
            println!(
                "run complete: execution_id={} requests={} succeeded={} rows={} failed={}",
                summary.execution_id,
                summary.total_requests,
                summary.successful_responses,
                summary.rows_written,
                summary.failed_requests
            );
        }
        Commands::Plan => {
            let config = CwvConfig::load()?;
            let descriptors = planner::plan_requests(&config.urls, &config.form_factors)?;
            for descriptor in &descriptors {
                println!("{}\t{}", descriptor.form_factor, descriptor.url);
            }
            println!("{} requests planned", descriptors.len());
        }
        Commands::Schedule => {
            let config = CwvConfig::load()?;
            config.validate()?;
            let Some(mut sched) = cwv_sync::maybe_build_scheduler(&config, &guard).await? else {
                bail!("scheduler disabled; set CWV_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
        Commands::History { runs } => {
            let config = CwvConfig::load()?;
            let store = WorkbookStore::new(config.data_dir.clone());
            let markdown = cwv_sync::history_markdown(&store, &config.spreadsheet_id, runs).await?;
            println!("{markdown}");
        }
    }

    Ok(())
}
