//! Execution planning: turn an opportunity into a simulated, costed,
//! routable bundle, or reject it with a reason the audit log can carry.
//!
//! The simulation step is mandatory; no bundle is ever produced without
//! it.

use std::sync::Arc;

use alloy::primitives::{B256, U256};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info};

use liquidator_core::config::BotConfig;
use liquidator_core::error::{RpcError, SimulationError};
use liquidator_core::math;
use liquidator_core::planner::{calculate_costs, BribeController, CostError, CostInputs};
use liquidator_core::safety::SubmissionSample;
use liquidator_core::types::{Bundle, BundleError, LiquidationTx, Opportunity, SubmissionPath};

use crate::executor::ExecutorClient;
use crate::gas;
use crate::l1fee::L1FeeOracle;
use crate::provider::ProviderManager;
use crate::submit::SubmissionRouter;

/// Fraction of the estimated gross profit enforced on-chain as
/// `min_profit` (conservative floor).
fn min_profit_fraction() -> Decimal {
    Decimal::new(50, 2)
}

/// Why an opportunity did not become a bundle.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("unknown asset {0}")]
    UnknownAsset(String),

    #[error("unknown protocol {0}")]
    UnknownProtocol(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error(transparent)]
    Cost(#[from] CostError),

    #[error("net profit ${net} below minimum ${min}")]
    BelowMinimumProfit { net: Decimal, min: Decimal },

    #[error(transparent)]
    Bundle(#[from] BundleError),
}

impl PlanError {
    /// Compact reason string for ExecutionRecord rows.
    pub fn reason(&self) -> String {
        match self {
            Self::Simulation(SimulationError::Reverted(msg)) => format!("revert: {msg}"),
            Self::Simulation(SimulationError::NoProfit) => "zero_or_negative_profit".to_string(),
            Self::BelowMinimumProfit { .. } => "insufficient_profit".to_string(),
            Self::Cost(_) => "cost_calculation_failed".to_string(),
            other => other.to_string(),
        }
    }

    /// True when the failure happened during (not before) simulation.
    pub fn is_simulation_failure(&self) -> bool {
        matches!(self, Self::Simulation(_))
    }
}

/// Plans and submits bundles for validated opportunities.
pub struct ExecutionPlanner {
    config: Arc<BotConfig>,
    provider: Arc<ProviderManager>,
    executor: Arc<ExecutorClient>,
    l1_fee_oracle: L1FeeOracle,
    router: SubmissionRouter,
    bribe: Mutex<BribeController>,
}

impl ExecutionPlanner {
    pub fn new(
        config: Arc<BotConfig>,
        provider: Arc<ProviderManager>,
        executor: Arc<ExecutorClient>,
        l1_fee_oracle: L1FeeOracle,
        router: SubmissionRouter,
    ) -> Self {
        let bribe = BribeController::new(
            config.execution.baseline_bribe_percent,
            config.execution.bribe_increase_percent,
            config.execution.bribe_decrease_percent,
            config.execution.max_bribe_percent,
        );
        Self { config, provider, executor, l1_fee_oracle, router, bribe: Mutex::new(bribe) }
    }

    pub fn router(&self) -> &SubmissionRouter {
        &self.router
    }

    /// Current bribe percentage.
    pub fn bribe_percent(&self) -> Decimal {
        self.bribe.lock().percent()
    }

    /// Feed a 100-submission window into the bribe ladder.
    pub fn update_bribe_model(&self, window: &[SubmissionSample]) {
        self.bribe.lock().update(window);
    }

    /// Build, simulate and cost a transaction for this opportunity.
    pub async fn plan(
        &self,
        opportunity: &Opportunity,
        eth_usd_price: Decimal,
    ) -> Result<Bundle, PlanError> {
        let position = opportunity.position();

        let protocol = self
            .config
            .protocols
            .get(&position.protocol)
            .ok_or_else(|| PlanError::UnknownProtocol(position.protocol.clone()))?;
        let debt_decimals = self
            .config
            .asset_decimals(position.debt_asset)
            .ok_or_else(|| PlanError::UnknownAsset(format!("{:#x}", position.debt_asset)))?;
        let collateral_decimals = self
            .config
            .asset_decimals(position.collateral_asset)
            .ok_or_else(|| PlanError::UnknownAsset(format!("{:#x}", position.collateral_asset)))?;

        // Conservative on-chain floor: half the estimated gross profit,
        // denominated in the debt asset at the snapshot price.
        let min_profit_wei = math::usd_to_token_amount(
            opportunity.estimated_gross_profit_usd() * min_profit_fraction(),
            debt_decimals,
            opportunity.debt_price_usd(),
        );

        let calldata = self.executor.encode_liquidation(
            protocol.address,
            position.user,
            position.collateral_asset,
            position.debt_asset,
            position.debt_amount,
            min_profit_wei,
            protocol.aave_style,
        );

        let quote =
            gas::fetch_quote(&self.provider, self.config.execution.priority_fee_gwei).await?;
        let nonce = self.provider.transaction_count(self.executor.operator()).await?;

        let tx = LiquidationTx {
            to: self.executor.address(),
            data: calldata,
            value: U256::ZERO,
            gas_limit: self.config.execution.fallback_gas_limit,
            max_fee_per_gas: quote.max_fee_per_gas,
            max_priority_fee_per_gas: quote.priority_fee_wei,
            nonce,
            chain_id: self.config.chain_id,
        };
        debug!(nonce, gas_limit = tx.gas_limit, "transaction constructed");

        // Mandatory simulation.
        let outcome = self.executor.simulate(&tx, position.debt_asset).await?;

        let l1_fee_wei = self.l1_fee_oracle.l1_fee(&tx.data).await;

        let collateral_value_usd = math::usd_value(
            position.collateral_amount,
            collateral_decimals,
            opportunity.collateral_price_usd(),
        )
        .ok_or(CostError::Overflow)?;
        let debt_value_usd = math::usd_value(
            position.debt_amount,
            debt_decimals,
            opportunity.debt_price_usd(),
        )
        .ok_or(CostError::Overflow)?;

        let costs = calculate_costs(&CostInputs {
            gas_estimate: outcome.gas_estimate,
            base_fee_wei: quote.base_fee_wei,
            priority_fee_wei: quote.priority_fee_wei,
            l1_fee_wei,
            calldata_len: tx.data.len(),
            simulated_profit_wei: outcome.profit_wei,
            debt_decimals,
            debt_price_usd: opportunity.debt_price_usd(),
            debt_value_usd,
            collateral_value_usd,
            eth_usd_price,
            bribe_percent: self.bribe_percent(),
            max_bribe_percent: self.config.execution.max_bribe_percent,
            flash_loan_premium_percent: self.config.execution.flash_loan_premium_percent,
            max_slippage_percent: self.config.dex.max_slippage_percent,
        })?;

        if costs.net_profit_usd < self.config.safety.min_profit_usd {
            return Err(PlanError::BelowMinimumProfit {
                net: costs.net_profit_usd,
                min: self.config.safety.min_profit_usd,
            });
        }

        let path = liquidator_core::planner::select_path(
            &self.router.snapshots(),
            costs.simulated_profit_usd,
            costs.bribe_usd,
        );

        let bundle = Bundle::new(
            opportunity.clone(),
            tx,
            outcome.profit_wei,
            outcome.gas_estimate,
            costs,
            path,
        )?;

        info!(
            protocol = %position.protocol,
            borrower = %position.user,
            net_profit_usd = %bundle.net_profit_usd(),
            path = %bundle.submission_path(),
            "bundle created"
        );
        Ok(bundle)
    }

    /// Sign and submit a bundle on its selected path.
    pub async fn submit(&self, bundle: &Bundle) -> Result<B256, RpcError> {
        let raw = self.router.sign(bundle.transaction()).await?;
        self.router.submit(bundle.submission_path(), &raw).await
    }
}
