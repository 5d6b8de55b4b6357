//! Protocol-level guards and canonical position reads.
//!
//! Each configured pool exposes a position reader used for cache
//! bootstrap and reconciliation, and an optional pause flag checked
//! before execution.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use tracing::{debug, warn};

use liquidator_core::config::ProtocolConfig;
use liquidator_core::error::RpcError;
use liquidator_core::traits::ProtocolGuard;

use crate::provider::{build_http, ProviderManager};

sol! {
    #[sol(rpc)]
    interface IPausablePool {
        function paused() external view returns (bool);
    }

    #[sol(rpc)]
    interface IPositionReader {
        function getUserPosition(address user) external view returns (
            address collateralAsset,
            uint256 collateralAmount,
            address debtAsset,
            uint256 debtAmount
        );
    }
}

/// Canonical on-chain view of one borrower's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalPosition {
    pub collateral_asset: Address,
    pub collateral_amount: U256,
    pub debt_asset: Address,
    pub debt_amount: U256,
}

/// Registry of configured lending pools.
pub struct ProtocolRegistry {
    provider: Arc<ProviderManager>,
    pools: HashMap<String, Address>,
}

impl ProtocolRegistry {
    pub fn new(provider: Arc<ProviderManager>, protocols: &HashMap<String, ProtocolConfig>) -> Self {
        let pools = protocols.iter().map(|(name, p)| (name.clone(), p.address)).collect();
        Self { provider, pools }
    }

    pub fn pool_address(&self, protocol: &str) -> Option<Address> {
        self.pools.get(protocol).copied()
    }

    /// Canonical position at the latest block (cache bootstrap path).
    pub async fn canonical_position(
        &self,
        protocol: &str,
        user: Address,
    ) -> Result<CanonicalPosition, RpcError> {
        let pool = self
            .pool_address(protocol)
            .ok_or_else(|| RpcError::Transport(format!("unknown protocol {protocol}")))?;
        let request = position_request(pool, user);
        let data = self.provider.call(&request).await?;
        decode_position(&data)
    }

    /// Canonical position at a specific block, answered by the archive
    /// endpoint (reconciliation path).
    pub async fn canonical_position_at(
        &self,
        protocol: &str,
        user: Address,
        block: u64,
    ) -> Result<CanonicalPosition, RpcError> {
        let pool = self
            .pool_address(protocol)
            .ok_or_else(|| RpcError::Transport(format!("unknown protocol {protocol}")))?;
        let request = position_request(pool, user);
        let data = self.provider.call_at(&request, block).await?;
        decode_position(&data)
    }
}

fn position_request(pool: Address, user: Address) -> TransactionRequest {
    let call = IPositionReader::getUserPositionCall { user };
    TransactionRequest::default()
        .with_to(pool)
        .with_input(call.abi_encode())
}

fn decode_position(data: &[u8]) -> Result<CanonicalPosition, RpcError> {
    let decoded = IPositionReader::getUserPositionCall::abi_decode_returns(data, true)
        .map_err(|e| RpcError::Transport(format!("bad position payload: {e}")))?;
    Ok(CanonicalPosition {
        collateral_asset: decoded.collateralAsset,
        collateral_amount: decoded.collateralAmount,
        debt_asset: decoded.debtAsset,
        debt_amount: decoded.debtAmount,
    })
}

#[async_trait]
impl ProtocolGuard for ProtocolRegistry {
    /// A protocol blocks liquidation only when its pool reports
    /// `paused() == true`. Pools without a pause flag revert here, which
    /// reads as not paused.
    async fn liquidation_allowed(&self, protocol: &str) -> bool {
        let Some(pool) = self.pool_address(protocol) else {
            warn!(protocol, "unknown protocol in pause check");
            return false;
        };
        let Ok(provider) = build_http(self.provider.primary_url()) else {
            return false;
        };
        let contract = IPausablePool::new(pool, &provider);
        match contract.paused().call().await {
            Ok(result) => {
                if result._0 {
                    warn!(protocol, pool = %pool, "protocol is paused");
                }
                !result._0
            }
            Err(e) => {
                debug!(protocol, pool = %pool, error = %e, "pause flag not readable, assuming live");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_payload_round_trips() {
        let ret = IPositionReader::getUserPositionReturn {
            collateralAsset: Address::repeat_byte(1),
            collateralAmount: U256::from(1000u64),
            debtAsset: Address::repeat_byte(2),
            debtAmount: U256::from(500u64),
        };
        let encoded = IPositionReader::getUserPositionCall::abi_encode_returns(&(
            ret.collateralAsset,
            ret.collateralAmount,
            ret.debtAsset,
            ret.debtAmount,
        ));

        let decoded = decode_position(&encoded).unwrap();
        assert_eq!(decoded.collateral_asset, Address::repeat_byte(1));
        assert_eq!(decoded.collateral_amount, U256::from(1000u64));
        assert_eq!(decoded.debt_amount, U256::from(500u64));
    }
}
