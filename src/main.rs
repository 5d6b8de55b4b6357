//! Rollup liquidation engine.
//!
//! Mirrors lending-market state over WebSocket, detects liquidatable
//! positions with multi-oracle confirmation, simulates and costs every
//! candidate, and submits by the highest-expected-value path under the
//! safety controller's limits.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use liquidator_chain::{
    ExecutionPlanner, ExecutorClient, L1FeeOracle, OracleGateway, ProtocolRegistry,
    ProviderManager, SubmissionRouter, WsListener,
};
use liquidator_core::{BotConfig, OpportunityDetector, SafetyController};
use liquidator_store::{AuditLog, PositionCache};

mod engine;
mod orchestrator;
mod telemetry;

use engine::StateEngine;
use orchestrator::{Orchestrator, RunOutcome};

/// Exit codes: 0 clean shutdown, 1 fatal initialization failure,
/// 2 unrecoverable runtime failure.
const EXIT_INIT_FAILURE: i32 = 1;
const EXIT_RUNTIME_FAILURE: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "liquidator", about = "Automated on-chain liquidation engine")]
struct Cli {
    /// Detect and simulate, but never submit transactions.
    #[arg(long)]
    dry_run: bool,

    /// Configuration file path.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    telemetry::init_logging();

    let exit_code = match run(cli).await {
        Ok(RunOutcome::Clean) => 0,
        Ok(RunOutcome::Fatal) => EXIT_RUNTIME_FAILURE,
        Err(e) => {
            error!(error = %format!("{e:#}"), "initialization failed");
            EXIT_INIT_FAILURE
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<RunOutcome> {
    let config = Arc::new(BotConfig::load(&cli.config).context("loading configuration")?);
    info!(
        network = %config.network,
        chain_id = config.chain_id,
        config = %cli.config.display(),
        dry_run = cli.dry_run,
        "configuration loaded"
    );
    if cli.dry_run {
        warn!(dry_run = true, "dry-run mode: no transaction will be submitted");
    }

    // Operator signing key, from the environment or a key file. Never
    // logged, never written anywhere.
    let operator_key = load_operator_key()?;

    let metrics_handle = telemetry::init_metrics().context("installing metrics recorder")?;

    // Connectors.
    let provider =
        Arc::new(ProviderManager::new(&config.rpc).context("building provider manager")?);
    let ws = Arc::new(WsListener::new(&config.rpc));

    // Storage.
    let cache = Arc::new(PositionCache::connect(&config.redis).await);
    let audit = match AuditLog::connect(&config.database).await {
        Ok(audit) => Arc::new(audit),
        Err(e) if cli.dry_run => {
            warn!(error = %e, "database unavailable, dry-run continues with queue-only audit log");
            Arc::new(AuditLog::disconnected())
        }
        Err(e) => return Err(e).context("connecting audit database"),
    };

    // Chain-side components.
    let router = SubmissionRouter::new(
        &operator_key,
        config.rpc.primary_http.clone(),
        config.execution.builder_url.clone(),
        config.rpc.backup_http.clone(),
    )
    .context("building submission router")?;
    drop(operator_key);

    let operator = router.operator();
    let executor = Arc::new(ExecutorClient::new(
        provider.clone(),
        config.execution.executor_contract,
        operator,
    ));
    let l1_fee_oracle = L1FeeOracle::new(provider.clone(), config.execution.l1_gas_oracle);
    let registry = Arc::new(ProtocolRegistry::new(provider.clone(), &config.protocols));
    let oracle = Arc::new(OracleGateway::new(provider.clone(), &config.assets, &config.oracles));

    // Core logic.
    let safety = Arc::new(SafetyController::new(config.safety.clone(), audit.clone()));
    let detector = Arc::new(OpportunityDetector::new(
        config.clone(),
        cache.clone(),
        oracle.clone(),
        registry.clone(),
    ));
    let planner = Arc::new(ExecutionPlanner::new(
        config.clone(),
        provider.clone(),
        executor.clone(),
        l1_fee_oracle,
        router,
    ));
    let state_engine = Arc::new(StateEngine::new(
        config.clone(),
        provider.clone(),
        registry.clone(),
        cache.clone(),
        safety.clone(),
        audit.clone(),
    ));

    preflight(&config, &provider, operator, cli.dry_run).await?;

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        provider.clone(),
        ws,
        state_engine,
        detector,
        planner,
        executor,
        oracle,
        safety.clone(),
        cache,
        audit,
        cli.dry_run,
    ));

    // Operator HTTP surface: /metrics, /health, /resume.
    let running = Arc::new(AtomicBool::new(true));
    let shutdown = orchestrator.shutdown_handle();
    {
        let safety = safety.clone();
        let running = running.clone();
        let shutdown_rx = shutdown.subscribe();
        let port = config.monitoring.metrics_port;
        tokio::spawn(async move {
            if let Err(e) =
                telemetry::serve_http(port, metrics_handle, safety, running, shutdown_rx).await
            {
                error!(error = %e, "metrics endpoint failed");
            }
        });
    }

    // Signal-driven shutdown.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = shutdown.send(true);
            }
        });
    }

    let outcome = orchestrator.run().await;
    running.store(false, Ordering::Relaxed);
    info!(outcome = ?outcome, "liquidator stopped");
    Ok(outcome)
}

/// Retrieve the operator key from `OPERATOR_PRIVATE_KEY` or the file
/// named by `OPERATOR_KEY_FILE`.
fn load_operator_key() -> Result<String> {
    if let Ok(key) = std::env::var("OPERATOR_PRIVATE_KEY") {
        return Ok(key);
    }
    if let Ok(path) = std::env::var("OPERATOR_KEY_FILE") {
        let key = std::fs::read_to_string(&path)
            .with_context(|| format!("reading operator key file {path}"))?;
        return Ok(key.trim().to_string());
    }
    anyhow::bail!("no operator key: set OPERATOR_PRIVATE_KEY or OPERATOR_KEY_FILE")
}

/// Boot checks: RPC liveness, executor contract code, operator gas
/// balance. Failures abort startup (exit 1).
async fn preflight(
    config: &BotConfig,
    provider: &ProviderManager,
    operator: alloy::primitives::Address,
    dry_run: bool,
) -> Result<()> {
    let block = provider.block_number().await.context("rpc preflight")?;
    info!(block, "rpc endpoints reachable");

    let chain_id = provider.chain_id().await.context("chain id preflight")?;
    anyhow::ensure!(
        chain_id == config.chain_id,
        "configured chain id {} but endpoint reports {}",
        config.chain_id,
        chain_id
    );

    let code = provider
        .code_at(config.execution.executor_contract)
        .await
        .context("executor code preflight")?;
    anyhow::ensure!(
        !code.is_empty(),
        "no contract code at executor address {:#x}",
        config.execution.executor_contract
    );
    info!(executor = %config.execution.executor_contract, "executor contract verified");

    let balance_wei = provider.balance(operator).await.context("operator balance preflight")?;
    let balance_eth =
        liquidator_core::math::token_units(balance_wei, 18).unwrap_or(Decimal::ZERO);
    let minimum: Decimal = "0.1".parse().unwrap();
    if balance_eth < minimum {
        if dry_run {
            warn!(balance_eth = %balance_eth, "operator balance below minimum (dry-run continues)");
        } else {
            anyhow::bail!("operator balance {balance_eth} ETH below minimum {minimum} ETH");
        }
    }
    info!(operator = %operator, balance_eth = %balance_eth, "operator wallet verified");

    Ok(())
}
