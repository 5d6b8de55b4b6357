//! EIP-1559 fee quoting for the rollup.
//!
//! Priority fee is a fixed operator setting (2 gwei by default); the max
//! fee leaves headroom for one full base-fee doubling.

use liquidator_core::error::RpcError;

use crate::provider::ProviderManager;

const GWEI: u128 = 1_000_000_000;

/// One gas quote for transaction construction and the cost model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasQuote {
    pub base_fee_wei: u128,
    pub priority_fee_wei: u128,
    pub max_fee_per_gas: u128,
}

/// `max_fee = 2 * base_fee + priority_fee`.
pub fn max_fee_per_gas(base_fee_wei: u128, priority_fee_wei: u128) -> u128 {
    base_fee_wei.saturating_mul(2).saturating_add(priority_fee_wei)
}

/// Fetch the current base fee and assemble a quote.
pub async fn fetch_quote(
    provider: &ProviderManager,
    priority_fee_gwei: u64,
) -> Result<GasQuote, RpcError> {
    let base_fee_wei = provider.latest_base_fee().await?;
    let priority_fee_wei = priority_fee_gwei as u128 * GWEI;
    Ok(GasQuote {
        base_fee_wei,
        priority_fee_wei,
        max_fee_per_gas: max_fee_per_gas(base_fee_wei, priority_fee_wei),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_fee_leaves_doubling_headroom() {
        // 1 gwei base, 2 gwei priority -> 4 gwei max.
        assert_eq!(max_fee_per_gas(GWEI, 2 * GWEI), 4 * GWEI);
        // 30 gwei base, 2 gwei priority -> 62 gwei max.
        assert_eq!(max_fee_per_gas(30 * GWEI, 2 * GWEI), 62 * GWEI);
    }

    #[test]
    fn zero_base_fee_still_pays_priority() {
        assert_eq!(max_fee_per_gas(0, 2 * GWEI), 2 * GWEI);
    }
}
