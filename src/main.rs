//! Fund reconciliation batch job.
//!
//! Reconciles the fund's contract ledger against bitcoin settlement
//! history and writes the audit report artifacts. Designed to run
//! periodically; state carried between runs lives in the SQLite
//! cache/snapshot database.
//!
//! # Exit Codes
//!
//! - 0: run completed, reports written (even with per-investor failures)
//! - 1: runtime error (sources, storage, I/O)
//! - 2: corrupt upstream data detected; no reports written

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use fundrecon_backend::amount::DataCorruption;
use fundrecon_backend::cache::CacheStore;
use fundrecon_backend::models::Config;
use fundrecon_backend::recon::ReconEngine;
use fundrecon_backend::report;
use fundrecon_backend::snapshot::SnapshotStore;
use fundrecon_backend::sources::{EsploraClient, HttpLedgerClient};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fundrecon", about = "Reconcile the fund ledger against bitcoin settlement")]
struct Cli {
    /// Contract-indexer gateway base URL.
    #[arg(long)]
    ledger_url: Option<String>,

    /// Esplora-compatible chain API base URL.
    #[arg(long)]
    esplora_url: Option<String>,

    /// SQLite database for cache and snapshots.
    #[arg(long)]
    database: Option<String>,

    /// Directory for report artifacts.
    #[arg(long)]
    output_dir: Option<String>,

    /// Parallel investor pipelines.
    #[arg(long)]
    max_investors: Option<usize>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => {}
        Err(e) if e.downcast_ref::<DataCorruption>().is_some() => {
            error!("aborted, no reports written: {e:#}");
            std::process::exit(2);
        }
        Err(e) => {
            error!("run failed: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(url) = cli.ledger_url {
        config.ledger_api_url = url;
    }
    if let Some(url) = cli.esplora_url {
        config.esplora_api_url = url;
    }
    if let Some(path) = cli.database {
        config.database_path = path;
    }
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    if let Some(n) = cli.max_investors {
        config.max_parallel_investors = n;
    }

    let started_at = Utc::now();
    info!(
        ledger = %config.ledger_api_url,
        chain = %config.esplora_api_url,
        "fundrecon starting"
    );

    let cache = Arc::new(CacheStore::open(&config.database_path)?);
    let snapshots = Arc::new(SnapshotStore::open(&config.database_path)?);
    let timeout = Duration::from_secs(config.http_timeout_secs);

    let ledger = Arc::new(HttpLedgerClient::new(
        &config.ledger_api_url,
        cache.clone(),
        timeout,
    )?);
    let chain = Arc::new(EsploraClient::new(
        &config.esplora_api_url,
        cache,
        config.max_parallel_chain_requests,
        timeout,
    )?);

    let engine = ReconEngine::new(ledger, chain, snapshots, config.max_parallel_investors);
    let aggregate = engine.run().await?;

    report::log_summary(&aggregate);
    report::write_reports(&aggregate, &config.output_dir, started_at)?;

    if aggregate.investors_failed > 0 {
        info!(
            failed = aggregate.investors_failed,
            "some investors were skipped; they will be retried next run"
        );
    }
    Ok(())
}
