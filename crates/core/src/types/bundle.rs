//! Transaction envelopes and simulated bundles.

use alloy::primitives::{Address, Bytes, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::opportunity::Opportunity;

/// Typed EIP-1559 envelope targeting the operator's executor contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationTx {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub nonce: u64,
    pub chain_id: u64,
}

/// Outbound submission channels, in tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionPath {
    Mempool,
    Builder,
    PrivateRpc,
}

impl SubmissionPath {
    /// All paths in preference order; ties in expected value resolve to the
    /// earliest entry.
    pub const ALL: [SubmissionPath; 3] =
        [SubmissionPath::Mempool, SubmissionPath::Builder, SubmissionPath::PrivateRpc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mempool => "mempool",
            Self::Builder => "builder",
            Self::PrivateRpc => "private_rpc",
        }
    }
}

impl std::fmt::Display for SubmissionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full cost decomposition of a simulated bundle, all in USD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub simulated_profit_usd: Decimal,
    pub l2_gas_cost_usd: Decimal,
    pub l1_data_cost_usd: Decimal,
    pub bribe_usd: Decimal,
    pub flash_loan_cost_usd: Decimal,
    pub slippage_cost_usd: Decimal,
    pub total_cost_usd: Decimal,
    pub net_profit_usd: Decimal,
}

/// Rejected by the [`Bundle`] constructor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BundleError {
    #[error("net profit ${0} is not positive")]
    Unprofitable(Decimal),

    #[error("cost breakdown does not reconcile: net {net} != simulated {simulated} - total {total}")]
    Inconsistent {
        net: Decimal,
        simulated: Decimal,
        total: Decimal,
    },
}

/// A simulated, costed `(Opportunity, LiquidationTx)` pair ready for the
/// safety gate. `net_profit_usd > 0` and the cost decomposition identity
/// are constructor invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    opportunity: Opportunity,
    transaction: LiquidationTx,
    simulated_profit_wei: U256,
    gas_estimate: u64,
    costs: CostBreakdown,
    submission_path: SubmissionPath,
}

impl Bundle {
    pub fn new(
        opportunity: Opportunity,
        transaction: LiquidationTx,
        simulated_profit_wei: U256,
        gas_estimate: u64,
        costs: CostBreakdown,
        submission_path: SubmissionPath,
    ) -> Result<Self, BundleError> {
        if costs.net_profit_usd <= Decimal::ZERO {
            return Err(BundleError::Unprofitable(costs.net_profit_usd));
        }
        let expected_net = costs.simulated_profit_usd - costs.total_cost_usd;
        if costs.net_profit_usd != expected_net {
            return Err(BundleError::Inconsistent {
                net: costs.net_profit_usd,
                simulated: costs.simulated_profit_usd,
                total: costs.total_cost_usd,
            });
        }
        Ok(Self {
            opportunity,
            transaction,
            simulated_profit_wei,
            gas_estimate,
            costs,
            submission_path,
        })
    }

    pub fn opportunity(&self) -> &Opportunity {
        &self.opportunity
    }

    pub fn transaction(&self) -> &LiquidationTx {
        &self.transaction
    }

    pub fn simulated_profit_wei(&self) -> U256 {
        self.simulated_profit_wei
    }

    pub fn gas_estimate(&self) -> u64 {
        self.gas_estimate
    }

    pub fn costs(&self) -> &CostBreakdown {
        &self.costs
    }

    pub fn net_profit_usd(&self) -> Decimal {
        self.costs.net_profit_usd
    }

    pub fn submission_path(&self) -> SubmissionPath {
        self.submission_path
    }
}
