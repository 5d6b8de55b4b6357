//! Orchestrator: task lifecycle, the main scan loop, and degradation
//! handling.
//!
//! Five long-lived tasks: the WebSocket listener, the serial block
//! processor, the position scanner, the 5 s health monitor and the
//! metrics exporter. The event loop never crashes: per-opportunity errors
//! are caught and logged, and ten consecutive loop errors halt the
//! system. While HALTED the process keeps serving health and metrics,
//! accepts a manual resume, and flushes the audit queue; it never
//! submits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use liquidator_chain::{
    BlockHead, ExecutionPlanner, ExecutorClient, OracleGateway, PlanError, ProviderManager,
    WsListener,
};
use liquidator_core::traits::PositionStore;
use liquidator_core::types::{Bundle, ExecutionRecord, ExecutionStatus, Position, SystemState};
use liquidator_core::{BotConfig, OpportunityDetector, SafetyController};
use liquidator_store::{AuditLog, PositionCache};

use crate::engine::StateEngine;

/// Heads channel depth; the block processor drains it serially.
const HEADS_CHANNEL_CAPACITY: usize = 32;

/// Pending-block backpressure threshold: above this the scan tick is
/// skipped.
const MAX_PENDING_BLOCKS: usize = 2;

/// Consecutive skipped scan ticks before the system halts.
const MAX_SKIPPED_TICKS: u32 = 3;

/// Consecutive event-loop errors before the system halts.
const MAX_LOOP_ERRORS: u32 = 10;

/// Health monitor period.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Receipt poll period while waiting for inclusion.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Minimum operator gas balance in ETH.
const MIN_OPERATOR_BALANCE_ETH: &str = "0.1";

/// How the run ended; main maps this to an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Operator-requested shutdown.
    Clean,
    /// Unrecoverable runtime failure (both websocket endpoints dead).
    Fatal,
}

pub struct Orchestrator {
    config: Arc<BotConfig>,
    provider: Arc<ProviderManager>,
    ws: Arc<WsListener>,
    engine: Arc<StateEngine>,
    detector: Arc<OpportunityDetector>,
    planner: Arc<ExecutionPlanner>,
    executor: Arc<ExecutorClient>,
    oracle: Arc<OracleGateway>,
    safety: Arc<SafetyController>,
    cache: Arc<PositionCache>,
    audit: Arc<AuditLog>,
    dry_run: bool,
    heads_tx: mpsc::Sender<BlockHead>,
    heads_rx: Mutex<Option<mpsc::Receiver<BlockHead>>>,
    block_advance_tx: watch::Sender<u64>,
    opportunities_detected: AtomicU64,
    bundles_submitted: AtomicU64,
    dry_run_simulations: AtomicU64,
    dry_run_rejections: AtomicU64,
    dry_run_theoretical_profit: Mutex<Decimal>,
    shutdown_tx: watch::Sender<bool>,
    fatal_tx: watch::Sender<bool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<BotConfig>,
        provider: Arc<ProviderManager>,
        ws: Arc<WsListener>,
        engine: Arc<StateEngine>,
        detector: Arc<OpportunityDetector>,
        planner: Arc<ExecutionPlanner>,
        executor: Arc<ExecutorClient>,
        oracle: Arc<OracleGateway>,
        safety: Arc<SafetyController>,
        cache: Arc<PositionCache>,
        audit: Arc<AuditLog>,
        dry_run: bool,
    ) -> Self {
        let (heads_tx, heads_rx) = mpsc::channel(HEADS_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        let (fatal_tx, _) = watch::channel(false);
        let (block_advance_tx, _) = watch::channel(0u64);
        Self {
            config,
            provider,
            ws,
            engine,
            detector,
            planner,
            executor,
            oracle,
            safety,
            cache,
            audit,
            dry_run,
            heads_tx,
            heads_rx: Mutex::new(Some(heads_rx)),
            block_advance_tx,
            opportunities_detected: AtomicU64::new(0),
            bundles_submitted: AtomicU64::new(0),
            dry_run_simulations: AtomicU64::new(0),
            dry_run_rejections: AtomicU64::new(0),
            dry_run_theoretical_profit: Mutex::new(Decimal::ZERO),
            shutdown_tx,
            fatal_tx,
        }
    }

    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn safety(&self) -> Arc<SafetyController> {
        self.safety.clone()
    }

    /// Run every task until shutdown. Returns how the run ended.
    pub async fn run(self: Arc<Self>) -> RunOutcome {
        info!(dry_run = self.dry_run, "starting orchestrator");

        let mut tasks = Vec::new();

        // WS listener: block heads in, HALT when both endpoints die.
        {
            let this = self.clone();
            let heads_tx = self.heads_tx.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = this.ws.run(heads_tx, shutdown).await {
                    error!(error = %e, "websocket listener failed");
                    this.safety
                        .transition(SystemState::Halted, "all websocket endpoints failed")
                        .await;
                    let _ = this.fatal_tx.send(true);
                }
            }));
        }

        // Block processor: strictly serial, in arrival order.
        {
            let this = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let mut heads_rx = self
                .heads_rx
                .lock()
                .take()
                .expect("orchestrator can only run once");
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        head = heads_rx.recv() => {
                            match head {
                                Some(head) => {
                                    this.engine.process_head(head).await;
                                    let _ = this.block_advance_tx.send(head.number);
                                }
                                None => break,
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                info!("block processor stopped");
            }));
        }

        // Scanner: the main event loop.
        {
            let this = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                this.scan_loop(shutdown).await;
            }));
        }

        // Health monitor: ws health, block stalls, cache and db probes.
        {
            let this = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                this.monitor_loop(shutdown).await;
            }));
        }

        // Metrics exporter.
        {
            let this = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                this.metrics_loop(shutdown).await;
            }));
        }

        // Wait for an operator shutdown or a fatal runtime failure.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut fatal_rx = self.fatal_tx.subscribe();
        let outcome = tokio::select! {
            _ = shutdown_rx.changed() => RunOutcome::Clean,
            _ = fatal_rx.changed() => RunOutcome::Fatal,
        };

        let _ = self.shutdown_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }

        // Flush in-flight audit rows before exiting.
        let flushed = self.audit.flush().await;
        info!(flushed, outcome = ?outcome, "orchestrator stopped");
        outcome
    }

    /// Blocks sitting in the heads channel waiting for the serial
    /// processor.
    fn pending_blocks(&self) -> usize {
        HEADS_CHANNEL_CAPACITY.saturating_sub(self.heads_tx.capacity())
    }

    /// Position scan loop with backpressure and the consecutive-error
    /// tally.
    async fn scan_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.scan_interval_seconds));
        let mut skipped_ticks: u32 = 0;
        let mut consecutive_errors: u32 = 0;

        info!(interval_secs = self.config.scan_interval_seconds, "scan loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            // Backpressure: skip the tick while block processing is
            // behind; three consecutive skips halt.
            if self.pending_blocks() > MAX_PENDING_BLOCKS {
                skipped_ticks += 1;
                warn!(skipped_ticks, "block processing behind, skipping scan tick");
                if skipped_ticks >= MAX_SKIPPED_TICKS {
                    self.safety
                        .transition(SystemState::Halted, "block processing persistently behind")
                        .await;
                    skipped_ticks = 0;
                }
                continue;
            }
            skipped_ticks = 0;

            if self.safety.current_state() == SystemState::Halted {
                debug!("system halted, scan idle");
                continue;
            }

            let positions = self.cache.list_all().await;
            if positions.is_empty() {
                continue;
            }
            debug!(count = positions.len(), "scanning positions");

            for position in positions {
                if *shutdown.borrow() {
                    return;
                }
                match self.process_position(&position).await {
                    Ok(()) => consecutive_errors = 0,
                    Err(e) => {
                        consecutive_errors += 1;
                        error!(
                            protocol = %position.protocol,
                            user = %position.user,
                            error = %e,
                            consecutive_errors,
                            "error processing position"
                        );
                        if consecutive_errors >= MAX_LOOP_ERRORS {
                            self.safety
                                .transition(
                                    SystemState::Halted,
                                    &format!("{consecutive_errors} consecutive loop errors"),
                                )
                                .await;
                            consecutive_errors = 0;
                        }
                    }
                }
            }
        }
        info!("scan loop stopped");
    }

    /// Full pipeline for one position: detect, gate, plan, validate,
    /// submit (or dry-run log).
    async fn process_position(&self, position: &Position) -> anyhow::Result<()> {
        let block = self.cache.current_block();
        let Some(opportunity) = self.detector.check_position(position, block).await else {
            return Ok(());
        };

        self.opportunities_detected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("liquidator_opportunities_detected_total").increment(1);

        let state = self.safety.current_state();
        if !self.safety.can_execute() {
            debug!(state = %state, "execution gate closed, skipping opportunity");
            return Ok(());
        }

        let eth_usd = self.oracle.eth_usd().await;

        // A new block invalidates an in-flight simulation; the position
        // is rescanned against the new block on the next tick.
        let mut block_advanced = self.block_advance_tx.subscribe();
        let plan_result = tokio::select! {
            result = self.planner.plan(&opportunity, eth_usd) => result,
            _ = block_advanced.changed() => {
                debug!(
                    user = %opportunity.position().user,
                    "simulation cancelled by new block, requeued"
                );
                return Ok(());
            }
        };

        let bundle = match plan_result {
            Ok(bundle) => bundle,
            Err(e) => {
                if self.dry_run {
                    self.dry_run_rejections.fetch_add(1, Ordering::Relaxed);
                }
                let record = ExecutionRecord::rejection(
                    &opportunity,
                    state,
                    simulation_succeeded(&e),
                    e.reason(),
                );
                self.safety.record_execution(&record).await;
                return Ok(());
            }
        };

        if let Err(violation) = self.safety.validate_execution(&bundle).await {
            let record =
                ExecutionRecord::rejection(&opportunity, state, true, violation.to_string());
            self.safety.record_execution(&record).await;
            return Ok(());
        }

        if self.dry_run {
            self.dry_run_simulations.fetch_add(1, Ordering::Relaxed);
            let total = {
                let mut profit = self.dry_run_theoretical_profit.lock();
                *profit += bundle.net_profit_usd();
                *profit
            };
            info!(
                dry_run = true,
                protocol = %opportunity.position().protocol,
                borrower = %opportunity.position().user,
                net_profit_usd = %bundle.net_profit_usd(),
                simulated_profit_usd = %bundle.costs().simulated_profit_usd,
                total_cost_usd = %bundle.costs().total_cost_usd,
                submission_path = %bundle.submission_path(),
                health_factor = %opportunity.health_factor(),
                theoretical_profit_total = %total,
                "[dry-run] would submit bundle"
            );
            return Ok(());
        }

        match self.planner.submit(&bundle).await {
            Ok(tx_hash) => {
                self.bundles_submitted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("liquidator_bundles_submitted_total").increment(1);

                let record = ExecutionRecord::submitted(&bundle, state, Some(tx_hash));
                self.safety.record_execution(&record).await;

                self.spawn_receipt_watch(bundle, tx_hash, state);

                // Bribe and state-machine updates at 100-submission
                // boundaries only.
                if self.bundles_submitted.load(Ordering::Relaxed) % 100 == 0 {
                    let window = self.safety.submission_window();
                    self.planner.update_bribe_model(&window);
                    self.safety.check_and_apply_transitions().await;
                }
            }
            Err(e) => {
                warn!(error = %e, "bundle submission failed");
                let mut record = ExecutionRecord::submitted(&bundle, state, None);
                record.rejection_reason = Some(format!("submission failed: {e}"));
                self.safety.record_execution(&record).await;
            }
        }
        Ok(())
    }

    /// Watch for the inclusion outcome of a submitted bundle.
    fn spawn_receipt_watch(&self, bundle: Bundle, tx_hash: B256, state: SystemState) {
        let provider = self.provider.clone();
        let executor = self.executor.clone();
        let safety = self.safety.clone();
        let planner = self.planner.clone();
        let cache = self.cache.clone();
        let window_blocks = self.config.execution.inclusion_window_blocks;
        let submitted_at = self.cache.current_block();
        let debt_decimals = self
            .config
            .asset_decimals(bundle.opportunity().position().debt_asset)
            .unwrap_or(18);

        tokio::spawn(async move {
            let debt_asset = bundle.opportunity().position().debt_asset;
            let debt_price = bundle.opportunity().debt_price_usd();
            let balance_before = executor.treasury_balance(debt_asset).await.ok();

            loop {
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;

                match provider.transaction_receipt(tx_hash).await {
                    Ok(Some(receipt)) => {
                        let inclusion_block = receipt.block_number;
                        if receipt.status() {
                            let (actual_wei, actual_usd) = measure_actual_profit(
                                &executor,
                                debt_asset,
                                debt_decimals,
                                debt_price,
                                balance_before,
                                &bundle,
                            )
                            .await;
                            info!(
                                tx_hash = %tx_hash,
                                block = ?inclusion_block,
                                actual_profit_usd = %actual_usd,
                                "bundle included"
                            );
                            planner.router().record_success(bundle.submission_path());
                            let record = ExecutionRecord::outcome(
                                &bundle,
                                state,
                                tx_hash,
                                ExecutionStatus::Included,
                                inclusion_block,
                                Some(actual_wei),
                                Some(actual_usd),
                            );
                            safety.record_execution(&record).await;
                        } else {
                            warn!(tx_hash = %tx_hash, "bundle reverted on-chain");
                            let record = ExecutionRecord::outcome(
                                &bundle,
                                state,
                                tx_hash,
                                ExecutionStatus::Reverted,
                                inclusion_block,
                                None,
                                None,
                            );
                            safety.record_execution(&record).await;
                        }
                        return;
                    }
                    Ok(None) => {
                        if cache.current_block() > submitted_at + window_blocks {
                            warn!(tx_hash = %tx_hash, "inclusion window expired");
                            let record = ExecutionRecord::outcome(
                                &bundle,
                                state,
                                tx_hash,
                                ExecutionStatus::Expired,
                                None,
                                None,
                                None,
                            );
                            safety.record_execution(&record).await;
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(tx_hash = %tx_hash, error = %e, "receipt poll failed");
                    }
                }
            }
        });
    }

    /// Health monitor: every 5 s check the websocket, the block stall
    /// watchdog, and both storage backends.
    async fn monitor_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            if !self.ws.is_healthy() {
                warn!(idle_secs = self.ws.idle_seconds(), "websocket unhealthy");
            }

            // Block production stall: no header past the timeout halts.
            let idle = self.engine.seconds_since_last_head();
            if idle > liquidator_chain::STALL_TIMEOUT_SECS
                && self.safety.current_state() != SystemState::Halted
            {
                error!(idle_secs = idle, "block production stalled");
                self.safety
                    .transition(SystemState::Halted, &format!("no new block for {idle} seconds"))
                    .await;
            } else if idle > MONITOR_INTERVAL.as_secs() {
                warn!(idle_secs = idle, "block production delayed");
            }

            self.cache.ping().await;

            if self.audit.health_check().await && self.audit.queued() > 0 {
                self.audit.flush().await;
            }
        }
        info!("health monitor stopped");
    }

    /// Periodic metrics export and alert-condition checks.
    async fn metrics_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval =
            Duration::from_secs(self.config.monitoring.metrics_export_interval_seconds);
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let metrics_value = self.safety.calculate_metrics(false).await;
            let stats = self.cache.stats().await;
            let state = self.safety.current_state();

            metrics::gauge!("liquidator_system_state").set(state.as_gauge());
            metrics::gauge!("liquidator_inclusion_rate")
                .set(decimal_to_f64(metrics_value.inclusion_rate));
            metrics::gauge!("liquidator_simulation_accuracy")
                .set(decimal_to_f64(metrics_value.simulation_accuracy));
            metrics::gauge!("liquidator_total_profit_usd")
                .set(decimal_to_f64(metrics_value.total_profit_usd));
            metrics::gauge!("liquidator_daily_volume_usd")
                .set(decimal_to_f64(self.safety.daily_volume_usd()));
            metrics::gauge!("liquidator_daily_limit_usd")
                .set(decimal_to_f64(self.safety.limits().max_daily_volume_usd));
            metrics::gauge!("liquidator_consecutive_failures")
                .set(metrics_value.consecutive_failures as f64);
            metrics::gauge!("liquidator_positions_cached").set(stats.count as f64);
            metrics::gauge!("liquidator_bribe_percent")
                .set(decimal_to_f64(self.planner.bribe_percent()));

            let operator_balance_eth =
                match self.provider.balance(self.executor.operator()).await {
                    Ok(wei) => {
                        let eth = wei_to_eth(wei);
                        metrics::gauge!("liquidator_operator_balance_eth")
                            .set(decimal_to_f64(eth));
                        Some(eth)
                    }
                    Err(e) => {
                        debug!(error = %e, "operator balance unavailable");
                        None
                    }
                };

            self.check_alerts(state, operator_balance_eth);

            if self.dry_run {
                info!(
                    dry_run = true,
                    opportunities_detected =
                        self.opportunities_detected.load(Ordering::Relaxed),
                    simulations_success = self.dry_run_simulations.load(Ordering::Relaxed),
                    simulations_failed = self.dry_run_rejections.load(Ordering::Relaxed),
                    theoretical_profit_usd = %*self.dry_run_theoretical_profit.lock(),
                    positions_cached = stats.count,
                    current_block = stats.current_block,
                    "[dry-run] metrics snapshot"
                );
            } else {
                info!(
                    system_state = %state,
                    opportunities_detected =
                        self.opportunities_detected.load(Ordering::Relaxed),
                    bundles_submitted = self.bundles_submitted.load(Ordering::Relaxed),
                    inclusion_rate = %metrics_value.inclusion_rate,
                    simulation_accuracy = %metrics_value.simulation_accuracy,
                    daily_volume_usd = %self.safety.daily_volume_usd(),
                    consecutive_failures = metrics_value.consecutive_failures,
                    positions_cached = stats.count,
                    current_block = stats.current_block,
                    "metrics snapshot"
                );
            }
        }
        info!("metrics exporter stopped");
    }

    fn check_alerts(&self, state: SystemState, operator_balance_eth: Option<Decimal>) {
        let min_balance: Decimal = MIN_OPERATOR_BALANCE_ETH.parse().unwrap();

        if state == SystemState::Halted {
            error!(severity = "CRITICAL", "ALERT: system is HALTED");
        } else if state == SystemState::Throttled {
            warn!(severity = "HIGH", "ALERT: system is THROTTLED");
        }

        if let Some(balance) = operator_balance_eth {
            if balance < min_balance {
                error!(
                    severity = "CRITICAL",
                    balance_eth = %balance,
                    "ALERT: operator balance below minimum"
                );
            }
        }

        let daily = self.safety.daily_volume_usd();
        let cap = self.safety.limits().max_daily_volume_usd;
        if !cap.is_zero() && daily / cap > Decimal::new(80, 2) {
            warn!(
                severity = "MEDIUM",
                daily_volume_usd = %daily,
                cap_usd = %cap,
                "ALERT: daily volume above 80% of cap"
            );
        }
    }
}

/// Realized profit is the treasury's balance delta around inclusion; when
/// either read failed, the simulated figure stands in.
async fn measure_actual_profit(
    executor: &ExecutorClient,
    debt_asset: Address,
    debt_decimals: u8,
    debt_price: Decimal,
    balance_before: Option<U256>,
    bundle: &Bundle,
) -> (U256, Decimal) {
    let actual_wei = match (balance_before, executor.treasury_balance(debt_asset).await.ok()) {
        (Some(before), Some(after)) if after > before => after - before,
        _ => bundle.simulated_profit_wei(),
    };
    let actual_usd = liquidator_core::math::usd_value(actual_wei, debt_decimals, debt_price)
        .unwrap_or(bundle.costs().simulated_profit_usd);
    (actual_wei, actual_usd)
}

fn wei_to_eth(wei: U256) -> Decimal {
    liquidator_core::math::token_units(wei, 18).unwrap_or_default()
}

fn decimal_to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}

/// True when the plan failed after a successful simulation (the record's
/// `simulation_success` column should read true).
fn simulation_succeeded(e: &PlanError) -> bool {
    matches!(e, PlanError::BelowMinimumProfit { .. } | PlanError::Cost(_))
}
