//! cmsync: converge CMS collections on a local dataset.
//!
//! Usage:
//!   cmsync --config cmsync.json --data data.json [--cleanup] [--json]
//!
//! The API token is read from `CMSYNC_API_TOKEN` when set.

use anyhow::{Context, Result};
use clap::Parser;
use cmsync_cli::{CliConfig, TOKEN_ENV, load_datasets, render_summary, run};
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "cmsync")]
#[command(about = "Reconcile CMS collections with a declarative dataset")]
struct Args {
    /// Path to the JSON config (api, engine, plan)
    #[arg(short, long, default_value = "cmsync.json")]
    config: PathBuf,

    /// Path to the JSON dataset, keyed by collection
    #[arg(short, long)]
    data: PathBuf,

    /// Delete orphans after syncing
    #[arg(long)]
    cleanup: bool,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = CliConfig::load(&args.config)?.with_token(std::env::var(TOKEN_ENV).ok());
    let datasets = load_datasets(&args.data)?;
    info!(
        site = %config.plan.site_id,
        collections = config.plan.collections.len(),
        datasets = datasets.len(),
        "cmsync starting"
    );

    let report = run(&config, &datasets, args.cleanup).await?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize report")?
        );
    } else {
        print!("{}", render_summary(&report));
    }

    if report.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}
