//! State engine: one block-processing step per incoming header.
//!
//! Each header runs the sequencer guard, decodes the block's protocol
//! events into cache mutations, reconciles the cache against the archive
//! endpoint every N blocks, and advances the monotonic checkpoint. The
//! whole step targets 500 ms; overruns are logged, never fatal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use alloy::consensus::TxReceipt;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use liquidator_chain::{
    decode_log, sequencer, BlockHead, ProtocolEvent, ProtocolRegistry, ProviderManager,
};
use liquidator_core::math;
use liquidator_core::traits::{AuditSink, PositionStore};
use liquidator_core::types::{Position, StateDivergence, SystemState};
use liquidator_core::BotConfig;
use liquidator_core::SafetyController;
use liquidator_store::PositionCache;

/// Divergence above this halts the system.
const DIVERGENCE_HALT_BPS: u64 = 10;

/// Target duration for one block-processing step.
const BLOCK_BUDGET_MS: u128 = 500;

pub struct StateEngine {
    config: Arc<BotConfig>,
    provider: Arc<ProviderManager>,
    registry: Arc<ProtocolRegistry>,
    cache: Arc<PositionCache>,
    safety: Arc<SafetyController>,
    sink: Arc<dyn AuditSink>,
    prev_block: AtomicU64,
    prev_timestamp: AtomicU64,
    last_reconciled_block: AtomicU64,
    sub_threshold_divergences: AtomicU64,
    last_head_seen: Mutex<Instant>,
}

impl StateEngine {
    pub fn new(
        config: Arc<BotConfig>,
        provider: Arc<ProviderManager>,
        registry: Arc<ProtocolRegistry>,
        cache: Arc<PositionCache>,
        safety: Arc<SafetyController>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            provider,
            registry,
            cache,
            safety,
            sink,
            prev_block: AtomicU64::new(0),
            prev_timestamp: AtomicU64::new(0),
            last_reconciled_block: AtomicU64::new(0),
            sub_threshold_divergences: AtomicU64::new(0),
            last_head_seen: Mutex::new(Instant::now()),
        }
    }

    /// Seconds since the last header arrived; the 5 s watchdog halts the
    /// system past the stall timeout.
    pub fn seconds_since_last_head(&self) -> u64 {
        self.last_head_seen.lock().elapsed().as_secs()
    }

    /// Cumulative count of reconciliation divergences below the halt
    /// threshold. A rising trend points at a slow event-decode bug.
    pub fn sub_threshold_divergences(&self) -> u64 {
        self.sub_threshold_divergences.load(Ordering::Relaxed)
    }

    /// Process one header to completion. Serialized by the caller.
    pub async fn process_head(&self, head: BlockHead) {
        let started = Instant::now();
        *self.last_head_seen.lock() = Instant::now();

        let prev_block = self.prev_block.load(Ordering::Relaxed);
        let prev_timestamp = self.prev_timestamp.load(Ordering::Relaxed);

        // Record the observed header before judging it, so a halted
        // engine compares future headers against what actually arrived.
        self.prev_block.store(head.number, Ordering::Relaxed);
        self.prev_timestamp.store(head.timestamp, Ordering::Relaxed);

        match sequencer::assess(prev_block, prev_timestamp, head.number, head.timestamp) {
            sequencer::GuardVerdict::Halt(reason) => {
                error!(block = head.number, reason, "sequencer guard tripped");
                self.safety
                    .transition(SystemState::Halted, &format!("sequencer anomaly: {reason}"))
                    .await;
                return;
            }
            sequencer::GuardVerdict::Warn(reason) => {
                warn!(block = head.number, reason, "sequencer irregularity");
            }
            sequencer::GuardVerdict::Proceed => {}
        }

        self.cache.set_current_block(head.number);
        metrics::gauge!("liquidator_current_block").set(head.number as f64);

        self.process_block_events(head.number).await;

        if self.should_reconcile(head.number) {
            self.reconcile(head.number).await;
            self.last_reconciled_block.store(head.number, Ordering::Relaxed);
        }

        // Pending rebuild after a cache backend recovery: resync the
        // fallback layer, then let the next reconciliation verify it.
        if self.cache.take_rebuild_request() {
            let synced = self.cache.sync_fallback_to_backend().await;
            info!(synced, "cache rebuilt after backend recovery");
            self.reconcile(head.number).await;
        }

        self.cache.save_checkpoint(head.number).await;

        let elapsed = started.elapsed().as_millis();
        if elapsed > BLOCK_BUDGET_MS {
            warn!(block = head.number, elapsed_ms = elapsed, "block processing exceeded budget");
        } else {
            debug!(block = head.number, elapsed_ms = elapsed, "block processed");
        }
    }

    fn should_reconcile(&self, block: u64) -> bool {
        let last = self.last_reconciled_block.load(Ordering::Relaxed);
        block >= last + self.config.reconciliation_interval_blocks
    }

    /// Stream the block's receipts through the event decoder and apply
    /// the results to the cache. Decode failures are logged, never fatal.
    async fn process_block_events(&self, block: u64) {
        let receipts = match self.provider.block_receipts(block).await {
            Ok(Some(receipts)) => receipts,
            Ok(None) => {
                debug!(block, "no receipts for block yet");
                return;
            }
            Err(e) => {
                warn!(block, error = %e, "failed to fetch block receipts");
                return;
            }
        };

        let mut applied = 0usize;
        for receipt in &receipts {
            for log in receipt.inner.logs() {
                let Some(event) = decode_log(log) else { continue };
                if self.apply_event(&event, block).await {
                    applied += 1;
                }
            }
        }
        if applied > 0 {
            debug!(block, applied, "protocol events applied");
        }
    }

    /// Apply one decoded event. Events from unknown contracts are
    /// ignored. Returns true when the cache changed.
    async fn apply_event(&self, event: &ProtocolEvent, block: u64) -> bool {
        match event {
            ProtocolEvent::Borrow { contract, user, amount, .. } => {
                let Some(protocol) = self.config.protocol_by_address(*contract) else {
                    return false;
                };
                self.apply_debt_change(protocol, *user, *amount, true, block).await
            }
            ProtocolEvent::Repay { contract, user, amount, .. } => {
                let Some(protocol) = self.config.protocol_by_address(*contract) else {
                    return false;
                };
                self.apply_debt_change(protocol, *user, *amount, false, block).await
            }
            ProtocolEvent::Liquidation { contract, user, .. } => {
                let Some(protocol) = self.config.protocol_by_address(*contract) else {
                    return false;
                };
                info!(protocol, user = %user, block, "position liquidated, removing from cache");
                let _ = self.cache.remove(protocol, *user).await;
                true
            }
            ProtocolEvent::PriceUpdated { oracle, price, .. } => {
                debug!(oracle = %oracle, price = %price, "oracle price event observed");
                false
            }
        }
    }

    async fn apply_debt_change(
        &self,
        protocol: &str,
        user: alloy::primitives::Address,
        amount: alloy::primitives::U256,
        is_increase: bool,
        block: u64,
    ) -> bool {
        match self.cache.get(protocol, user).await {
            Some(mut position) => {
                if is_increase {
                    position.debt_amount += amount;
                } else {
                    position.debt_amount = position.debt_amount.saturating_sub(amount);
                }
                position.last_update_block = position.last_update_block.max(block);

                if position.is_closed() {
                    info!(protocol, user = %user, "debt fully repaid, removing position");
                    let _ = self.cache.remove(protocol, user).await;
                } else if let Err(e) = self.cache.upsert(position).await {
                    warn!(protocol, user = %user, error = %e, "failed to update position");
                    return false;
                }
                true
            }
            // First observation of this borrower: seed from canonical
            // state.
            None => self.seed_position(protocol, user, block).await,
        }
    }

    /// Create a cache entry from the pool's canonical view.
    async fn seed_position(
        &self,
        protocol: &str,
        user: alloy::primitives::Address,
        block: u64,
    ) -> bool {
        let canonical = match self.registry.canonical_position(protocol, user).await {
            Ok(canonical) => canonical,
            Err(e) => {
                warn!(protocol, user = %user, error = %e, "failed to fetch canonical position");
                return false;
            }
        };
        if canonical.debt_amount.is_zero() {
            return false;
        }
        let Some(threshold) = self
            .config
            .protocols
            .get(protocol)
            .map(|p| p.liquidation_threshold)
        else {
            return false;
        };

        match Position::new(
            protocol,
            user,
            canonical.collateral_asset,
            canonical.collateral_amount,
            canonical.debt_asset,
            canonical.debt_amount,
            threshold,
            block,
        ) {
            Ok(position) => {
                debug!(protocol, user = %user, block, "position seeded from chain");
                self.cache.upsert(position).await.is_ok()
            }
            Err(e) => {
                warn!(protocol, user = %user, error = %e, "invalid canonical position");
                false
            }
        }
    }

    /// Reconcile every cached position against the archive endpoint at
    /// this block. Divergence above 10 bps on any field halts; below, the
    /// canonical value silently wins and a trend counter advances.
    pub async fn reconcile(&self, block: u64) {
        let positions = self.cache.list_all().await;
        if positions.is_empty() {
            return;
        }
        debug!(block, count = positions.len(), "reconciling positions");

        for position in positions {
            let canonical = match self
                .registry
                .canonical_position_at(&position.protocol, position.user, block)
                .await
            {
                Ok(canonical) => canonical,
                Err(e) => {
                    warn!(
                        protocol = %position.protocol,
                        user = %position.user,
                        error = %e,
                        "reconciliation query failed"
                    );
                    continue;
                }
            };

            let fields = [
                ("collateral_amount", position.collateral_amount, canonical.collateral_amount),
                ("debt_amount", position.debt_amount, canonical.debt_amount),
            ];

            let mut halted = false;
            for (field, cached, chain) in fields {
                let Some(bps) = math::divergence_bps(cached, chain) else { continue };
                if bps > DIVERGENCE_HALT_BPS {
                    let divergence = StateDivergence {
                        timestamp: Utc::now(),
                        block_number: block,
                        protocol: position.protocol.clone(),
                        user: position.user,
                        field: field.to_string(),
                        cached_value: cached,
                        canonical_value: chain,
                        divergence_bps: bps,
                    };
                    error!(
                        protocol = %position.protocol,
                        user = %position.user,
                        field,
                        divergence_bps = bps,
                        "state divergence above threshold"
                    );
                    metrics::counter!("liquidator_state_divergence_events_total").increment(1);
                    if let Err(e) = self.sink.record_divergence(&divergence).await {
                        warn!(error = %e, "failed to persist divergence");
                    }
                    self.safety
                        .transition(
                            SystemState::Halted,
                            &format!("state divergence of {bps} bps on {field}"),
                        )
                        .await;
                    halted = true;
                } else if bps > 0 {
                    self.sub_threshold_divergences.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("liquidator_sub_threshold_divergences_total").increment(1);
                    debug!(
                        protocol = %position.protocol,
                        user = %position.user,
                        field,
                        divergence_bps = bps,
                        "sub-threshold divergence"
                    );
                }
            }
            if halted {
                return;
            }

            // Canonical values overwrite the cache.
            let mut updated = position;
            updated.collateral_asset = canonical.collateral_asset;
            updated.collateral_amount = canonical.collateral_amount;
            updated.debt_asset = canonical.debt_asset;
            updated.debt_amount = canonical.debt_amount;
            updated.last_update_block = updated.last_update_block.max(block);

            if updated.is_closed() {
                let _ = self.cache.remove(&updated.protocol, updated.user).await;
            } else if let Err(e) = self.cache.upsert(updated).await {
                warn!(error = %e, "failed to write reconciled position");
            }
        }
    }
}
