//! Executor contract interface: calldata encoding and the mandatory
//! pre-submission simulation.
//!
//! The simulation measures profit as the treasury's debt-asset balance
//! delta around an `eth_call` of the liquidation, then refines the gas
//! estimate. A candidate that reverts, shows no profit, or cannot be
//! measured is dropped.

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::sol;
use alloy::sol_types::SolCall;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use std::sync::Arc;

use liquidator_core::error::SimulationError;
use liquidator_core::types::LiquidationTx;

use crate::provider::{build_http, ProviderManager};

sol! {
    #[sol(rpc)]
    interface ILiquidationExecutor {
        function executeLiquidation(
            address lendingProtocol,
            address borrower,
            address collateralAsset,
            address debtAsset,
            uint256 debtAmount,
            uint256 minProfit,
            bool isAaveStyle
        ) external;

        function treasury() external view returns (address);
    }

    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
    }
}

/// What a successful simulation learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationOutcome {
    pub profit_wei: U256,
    pub gas_estimate: u64,
}

/// Client for the operator's on-chain executor contract.
pub struct ExecutorClient {
    provider: Arc<ProviderManager>,
    address: Address,
    operator: Address,
    treasury: OnceCell<Address>,
}

impl ExecutorClient {
    pub fn new(provider: Arc<ProviderManager>, address: Address, operator: Address) -> Self {
        Self { provider, address, operator, treasury: OnceCell::new() }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn operator(&self) -> Address {
        self.operator
    }

    /// Encode the `executeLiquidation` calldata.
    #[allow(clippy::too_many_arguments)]
    pub fn encode_liquidation(
        &self,
        lending_protocol: Address,
        borrower: Address,
        collateral_asset: Address,
        debt_asset: Address,
        debt_amount: U256,
        min_profit: U256,
        is_aave_style: bool,
    ) -> Bytes {
        let call = ILiquidationExecutor::executeLiquidationCall {
            lendingProtocol: lending_protocol,
            borrower,
            collateralAsset: collateral_asset,
            debtAsset: debt_asset,
            debtAmount: debt_amount,
            minProfit: min_profit,
            isAaveStyle: is_aave_style,
        };
        Bytes::from(call.abi_encode())
    }

    /// Treasury address, read once per process and cached.
    pub async fn treasury(&self) -> Result<Address, SimulationError> {
        self.treasury
            .get_or_try_init(|| async {
                let provider = build_http(self.provider.primary_url())
                    .map_err(|e| SimulationError::TreasuryUnavailable(e.to_string()))?;
                let contract = ILiquidationExecutor::new(self.address, &provider);
                let result = contract
                    .treasury()
                    .call()
                    .await
                    .map_err(|e| SimulationError::TreasuryUnavailable(e.to_string()))?;
                info!(treasury = %result._0, "executor treasury resolved");
                Ok(result._0)
            })
            .await
            .copied()
    }

    /// Treasury balance of a token at the latest block.
    pub async fn treasury_balance(&self, token: Address) -> Result<U256, SimulationError> {
        let treasury = self.treasury().await?;
        let provider = build_http(self.provider.primary_url())
            .map_err(|e| SimulationError::TreasuryUnavailable(e.to_string()))?;
        let contract = IERC20::new(token, &provider);
        let result = contract
            .balanceOf(treasury)
            .call()
            .await
            .map_err(|e| SimulationError::TreasuryUnavailable(e.to_string()))?;
        Ok(result._0)
    }

    /// Mandatory simulation: balance-before, `eth_call`, balance-after,
    /// then a gas estimate with the conservative fallback on failure.
    pub async fn simulate(
        &self,
        tx: &LiquidationTx,
        debt_asset: Address,
    ) -> Result<SimulationOutcome, SimulationError> {
        let balance_before = self.treasury_balance(debt_asset).await?;

        let request = simulation_request(self.operator, tx);
        if let Err(e) = self.provider.call(&request).await {
            let message = e.to_string();
            if message.contains("revert") || message.contains("execution reverted") {
                return Err(SimulationError::Reverted(message));
            }
            return Err(SimulationError::Reverted(format!("eth_call failed: {message}")));
        }

        let balance_after = self.treasury_balance(debt_asset).await?;
        if balance_after <= balance_before {
            debug!(
                before = %balance_before,
                after = %balance_after,
                "simulation produced no treasury profit"
            );
            return Err(SimulationError::NoProfit);
        }
        let profit_wei = balance_after - balance_before;

        let gas_estimate = match self.provider.estimate_gas(&request).await {
            Ok(gas) => gas,
            Err(e) => {
                warn!(error = %e, fallback = tx.gas_limit, "gas estimation failed, using fallback");
                tx.gas_limit
            }
        };

        info!(profit_wei = %profit_wei, gas_estimate, "simulation successful");
        Ok(SimulationOutcome { profit_wei, gas_estimate })
    }
}

/// Build the `eth_call` request mirroring the real transaction.
fn simulation_request(from: Address, tx: &LiquidationTx) -> TransactionRequest {
    TransactionRequest::default()
        .with_from(from)
        .with_to(tx.to)
        .with_input(tx.data.clone())
        .with_value(tx.value)
        .with_gas_limit(tx.gas_limit)
        .with_max_fee_per_gas(tx.max_fee_per_gas)
        .with_max_priority_fee_per_gas(tx.max_priority_fee_per_gas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use liquidator_core::config::RpcConfig;

    fn client() -> ExecutorClient {
        let rpc = RpcConfig {
            primary_http: "http://primary.invalid".to_string(),
            backup_http: "http://backup.invalid".to_string(),
            primary_ws: "ws://p".to_string(),
            backup_ws: "ws://b".to_string(),
            archive_http: "http://archive.invalid".to_string(),
            request_timeout_secs: 5,
        };
        ExecutorClient::new(
            Arc::new(ProviderManager::new(&rpc).unwrap()),
            Address::repeat_byte(0xEC),
            Address::repeat_byte(0x0A),
        )
    }

    #[test]
    fn calldata_has_selector_and_arguments() {
        let client = client();
        let data = client.encode_liquidation(
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            Address::repeat_byte(3),
            Address::repeat_byte(4),
            U256::from(1000u64),
            U256::from(500u64),
            true,
        );

        // 4-byte selector + 7 static words.
        assert_eq!(data.len(), 4 + 7 * 32);
        assert_eq!(&data[0..4], ILiquidationExecutor::executeLiquidationCall::SELECTOR);

        let decoded =
            ILiquidationExecutor::executeLiquidationCall::abi_decode(&data, true).unwrap();
        assert_eq!(decoded.borrower, Address::repeat_byte(2));
        assert_eq!(decoded.debtAmount, U256::from(1000u64));
        assert_eq!(decoded.minProfit, U256::from(500u64));
        assert!(decoded.isAaveStyle);
    }

    #[test]
    fn simulation_request_mirrors_transaction() {
        let tx = LiquidationTx {
            to: Address::repeat_byte(0xEC),
            data: Bytes::from(vec![1, 2, 3, 4]),
            value: U256::ZERO,
            gas_limit: 500_000,
            max_fee_per_gas: 4_000_000_000,
            max_priority_fee_per_gas: 2_000_000_000,
            nonce: 3,
            chain_id: 8453,
        };
        let request = simulation_request(Address::repeat_byte(0x0A), &tx);
        assert_eq!(request.from, Some(Address::repeat_byte(0x0A)));
        assert_eq!(request.gas, Some(500_000));
        assert_eq!(request.max_fee_per_gas, Some(4_000_000_000));
    }
}
