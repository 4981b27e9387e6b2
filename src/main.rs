//! reconcile - run the two-layer reconciliation scenario.
//!
//! Usage:
//!   reconcile                                   # simulated network
//!   reconcile --backend rpc --config reconcile.toml
//!   reconcile --tokens ETH --deposit-amount 0.5 --report report.json
//!
//! Exits 0 only when every step of every token passed. Failures exit with
//! 1 (setup), 2 (submission), 3 (precondition), 4 (confirmation timeout),
//! 5 (rejected), 6 (invariant violation), 7 (transport) or 8 (configuration).

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rollup_reconcile::config::{Backend, HarnessConfig};
use rollup_reconcile::models::TokenLike;
use rollup_reconcile::{run_all, HarnessContext, HarnessError, ScenarioReport};

#[derive(Parser, Debug)]
#[command(name = "reconcile")]
#[command(about = "End-to-end balance reconciliation for a chain and its rollup")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "RECONCILE_CONFIG")]
    config: Option<PathBuf>,

    /// Backend to run against (sim, rpc); overrides RECONCILE_BACKEND
    #[arg(short, long)]
    backend: Option<Backend>,

    /// Tokens to exercise, in order (ETH or ERC20 addresses, comma separated)
    #[arg(long, value_delimiter = ',')]
    tokens: Vec<TokenLike>,

    /// Total deposited per token, in whole-token units
    #[arg(long)]
    deposit_amount: Option<String>,

    /// Write the step report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG is used when unset
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    load_env();
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let code = match run(args).await {
        Ok(()) => {
            info!("reconciliation passed");
            0
        }
        Err(e) => {
            let code = exit_code(&e);
            let kind = e
                .downcast_ref::<HarnessError>()
                .map(HarnessError::kind)
                .unwrap_or("setup");
            error!(kind, exit_code = code, "reconciliation failed: {e:#}");
            code
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            HarnessConfig::from_file(path)?
        }
        None => HarnessConfig::default(),
    };
    config.apply_env()?;
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if !args.tokens.is_empty() {
        config.tokens = Some(args.tokens.clone());
    }
    if let Some(amount) = args.deposit_amount {
        config.amounts.deposit = amount;
    }

    info!(
        backend = ?config.backend,
        network = %config.network,
        deposit = %config.amounts.deposit,
        "starting reconciliation"
    );
    let ctx = HarnessContext::connect(config).await?;

    let mut report = ScenarioReport::new();
    let result = run_all(&ctx, &mut report).await;

    info!(
        steps = report.steps.len(),
        skipped = report.skipped(),
        elapsed_ms = (chrono::Utc::now() - report.started_at).num_milliseconds(),
        "scenario finished"
    );
    if let Some(path) = &args.report {
        write_report(path, &report)?;
    }
    result?;
    Ok(())
}

fn write_report(path: &Path, report: &ScenarioReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to encode report")?;
    std::fs::write(path, json).with_context(|| format!("failed to write report to {}", path.display()))?;
    info!("Report written to {}", path.display());
    Ok(())
}

fn exit_code(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<HarnessError>()
        .map(HarnessError::exit_code)
        .unwrap_or(1)
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory.
    let _ = dotenv();
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(format!(
            "rollup_reconcile={level},reconcile={level}"
        )),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "rollup_reconcile=info,reconcile=info".into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
