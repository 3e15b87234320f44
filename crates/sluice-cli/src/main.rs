//! sluice - batch-inference lifecycle CLI
//!
//! 各 subcommand は 1 cycle だけ実行し、report を JSON で stdout に出す。
//! ログは stderr（`RUST_LOG`、既定は info）。
//! invocation をまたぐカウンタは `SLUICE_CACHE_PATH`（既定 `.sluice/cache.json`）に残る。

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sluice_core::impls::{
    GithubActionsConfig, GithubActionsRunner, OpenAiBatchClient, OpenAiBatchConfig,
    RestStoreConfig, RestWorkStore,
};
use sluice_core::ports::SystemClock;
use sluice_core::{Endpoints, Orchestrator, OrchestratorBuilder, SluiceConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Claim, dispatch, poll and reconcile remote inference batches.
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Claim pending work items and dispatch them as one batch
    Claim {
        /// Target claim size (overrides SLUICE_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Task type to claim (overrides SLUICE_TASK_TYPE)
        #[arg(long)]
        task_type: Option<String>,
    },
    /// Poll pending batches and reconcile completed ones
    Poll,
    /// Release claims older than the stuck-lease timeout
    Recover {
        #[arg(long)]
        task_type: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build(config: SluiceConfig, endpoints: Endpoints) -> Result<Orchestrator> {
    let store = RestWorkStore::new(
        RestStoreConfig::new(&endpoints.store_url, &endpoints.store_key)
            .with_timeout(config.per_call_timeout),
    )
    .context("work store client")?;
    let store = Arc::new(store);
    let inference = OpenAiBatchClient::new(
        OpenAiBatchConfig::new(&endpoints.inference_url, &endpoints.inference_key)
            .with_timeout(config.per_call_timeout),
    )
    .context("batch api client")?;
    let runner = GithubActionsRunner::new(
        GithubActionsConfig::new(&endpoints.dispatch_url, &endpoints.dispatch_token)
            .with_timeout(config.per_call_timeout),
    )
    .context("workflow runner client")?;
    info!(cache = %config.cache_path.display(), "opening cache file");

    // cache は省略: config.cache_path の FileCache になる
    let orchestrator = OrchestratorBuilder::new(config)
        .with_clock(Arc::new(SystemClock))
        .with_store(store.clone())
        .with_ledger(store)
        .with_inference(Arc::new(inference))
        .with_runner(Arc::new(runner))
        .build()?;
    Ok(orchestrator)
}

fn emit<T: Serialize>(report: &T, success: bool) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing();

    let config = SluiceConfig::from_env().context("loading SLUICE_* configuration")?;
    let endpoints = Endpoints::from_env().context("loading SLUICE_* endpoints")?;
    let orchestrator = build(config, endpoints)?;
    info!(command = ?args.command, "starting");

    match args.command {
        Command::Claim {
            batch_size,
            task_type,
        } => {
            let report = orchestrator
                .run_claim_submit_cycle(task_type.as_deref(), batch_size)
                .await;
            emit(&report, report.success)
        }
        Command::Poll => {
            let report = orchestrator.run_poll_reconcile_cycle().await;
            emit(&report, report.success)
        }
        Command::Recover { task_type } => {
            let report = orchestrator.run_recovery(task_type.as_deref()).await;
            emit(&report, report.success)
        }
    }
}
