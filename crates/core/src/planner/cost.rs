//! Full cost decomposition for a simulated bundle.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::math;
use crate::types::CostBreakdown;

/// Fallback rate for the L1 data fee when the gas oracle is unreachable:
/// $0.001 per calldata byte.
fn l1_fallback_per_byte() -> Decimal {
    Decimal::new(1, 3)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CostError {
    #[error("bribe {bribe_percent}% exceeds cap {max_percent}%")]
    BribeCapExceeded {
        bribe_percent: Decimal,
        max_percent: Decimal,
    },

    #[error("amount outside representable range")]
    Overflow,
}

/// Every input the cost model needs. Holding these fixed, the output is
/// identical on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostInputs {
    pub gas_estimate: u64,
    pub base_fee_wei: u128,
    pub priority_fee_wei: u128,
    /// `getL1Fee(calldata)` result; `None` falls back to a per-byte rate
    pub l1_fee_wei: Option<u128>,
    pub calldata_len: usize,
    pub simulated_profit_wei: U256,
    pub debt_decimals: u8,
    pub debt_price_usd: Decimal,
    pub debt_value_usd: Decimal,
    pub collateral_value_usd: Decimal,
    pub eth_usd_price: Decimal,
    pub bribe_percent: Decimal,
    pub max_bribe_percent: Decimal,
    pub flash_loan_premium_percent: Decimal,
    pub max_slippage_percent: Decimal,
}

/// Compute the complete decomposition:
/// `net = simulated - (l2 + l1 + bribe + flash + slippage)`.
pub fn calculate_costs(inputs: &CostInputs) -> Result<CostBreakdown, CostError> {
    // L2 execution: gas * (base fee + priority fee), in wei, then USD.
    let l2_wei = (inputs.gas_estimate as u128)
        .checked_mul(inputs.base_fee_wei + inputs.priority_fee_wei)
        .ok_or(CostError::Overflow)?;
    let l2_gas_cost_usd = math::wei_to_usd(l2_wei, inputs.eth_usd_price);

    // L1 data posting, with the per-byte fallback when the oracle call
    // did not succeed.
    let l1_data_cost_usd = match inputs.l1_fee_wei {
        Some(wei) => math::wei_to_usd(wei, inputs.eth_usd_price),
        None => Decimal::from(inputs.calldata_len as u64) * l1_fallback_per_byte(),
    };

    // Simulated profit is denominated in the debt asset.
    let simulated_profit_usd = math::usd_value(
        inputs.simulated_profit_wei,
        inputs.debt_decimals,
        inputs.debt_price_usd,
    )
    .ok_or(CostError::Overflow)?;

    if inputs.bribe_percent > inputs.max_bribe_percent {
        return Err(CostError::BribeCapExceeded {
            bribe_percent: inputs.bribe_percent,
            max_percent: inputs.max_bribe_percent,
        });
    }
    let bribe_usd = simulated_profit_usd * inputs.bribe_percent / Decimal::ONE_HUNDRED;

    let flash_loan_cost_usd =
        inputs.debt_value_usd * inputs.flash_loan_premium_percent / Decimal::ONE_HUNDRED;

    let slippage_cost_usd =
        inputs.collateral_value_usd * inputs.max_slippage_percent / Decimal::ONE_HUNDRED;

    let total_cost_usd =
        l2_gas_cost_usd + l1_data_cost_usd + bribe_usd + flash_loan_cost_usd + slippage_cost_usd;
    let net_profit_usd = simulated_profit_usd - total_cost_usd;

    Ok(CostBreakdown {
        simulated_profit_usd,
        l2_gas_cost_usd,
        l1_data_cost_usd,
        bribe_usd,
        flash_loan_cost_usd,
        slippage_cost_usd,
        total_cost_usd,
        net_profit_usd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn inputs() -> CostInputs {
        CostInputs {
            gas_estimate: 350_000,
            base_fee_wei: 1_000_000_000,     // 1 gwei
            priority_fee_wei: 2_000_000_000, // 2 gwei
            l1_fee_wei: Some(50_000_000_000_000), // 0.00005 ETH
            calldata_len: 260,
            // 100e18 units of an 18-decimal $1 debt asset
            simulated_profit_wei: U256::from(100u64)
                * U256::from(10u64).pow(U256::from(18u64)),
            debt_decimals: 18,
            debt_price_usd: dec!(1),
            debt_value_usd: dec!(1000),
            collateral_value_usd: dec!(1200),
            eth_usd_price: dec!(2000),
            bribe_percent: dec!(15),
            max_bribe_percent: dec!(40),
            flash_loan_premium_percent: dec!(0.09),
            max_slippage_percent: dec!(1),
        }
    }

    #[test]
    fn breakdown_matches_hand_calculation() {
        let costs = calculate_costs(&inputs()).unwrap();

        // L2: 350_000 * 3 gwei = 0.00105 ETH = $2.10
        assert_eq!(costs.l2_gas_cost_usd, dec!(2.10));
        // L1: 0.00005 ETH = $0.10
        assert_eq!(costs.l1_data_cost_usd, dec!(0.1));
        assert_eq!(costs.simulated_profit_usd, dec!(100));
        assert_eq!(costs.bribe_usd, dec!(15));
        // Flash: 0.09% of $1000 = $0.90; slippage: 1% of $1200 = $12
        assert_eq!(costs.flash_loan_cost_usd, dec!(0.9));
        assert_eq!(costs.slippage_cost_usd, dec!(12));

        assert_eq!(
            costs.total_cost_usd,
            costs.l2_gas_cost_usd
                + costs.l1_data_cost_usd
                + costs.bribe_usd
                + costs.flash_loan_cost_usd
                + costs.slippage_cost_usd
        );
        assert_eq!(costs.net_profit_usd, costs.simulated_profit_usd - costs.total_cost_usd);
    }

    #[test]
    fn deterministic_given_inputs() {
        let a = calculate_costs(&inputs()).unwrap();
        let b = calculate_costs(&inputs()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn monotonic_in_gas_estimate() {
        let base = calculate_costs(&inputs()).unwrap();

        let mut more_gas = inputs();
        more_gas.gas_estimate += 100_000;
        let bigger = calculate_costs(&more_gas).unwrap();

        assert!(bigger.total_cost_usd > base.total_cost_usd);
        assert!(bigger.net_profit_usd <= base.net_profit_usd);
    }

    #[test]
    fn l1_fallback_uses_calldata_length() {
        let mut no_oracle = inputs();
        no_oracle.l1_fee_wei = None;
        let costs = calculate_costs(&no_oracle).unwrap();
        // 260 bytes * $0.001 = $0.26
        assert_eq!(costs.l1_data_cost_usd, dec!(0.260));
    }

    #[test]
    fn bribe_above_cap_is_rejected() {
        let mut greedy = inputs();
        greedy.bribe_percent = dec!(45);
        let err = calculate_costs(&greedy).unwrap_err();
        assert!(matches!(err, CostError::BribeCapExceeded { .. }));
    }

    #[test]
    fn profit_respects_debt_decimals() {
        // 100e6 units of a 6-decimal $1 asset is $100, not $1e-10.
        let mut usdc_debt = inputs();
        usdc_debt.simulated_profit_wei = U256::from(100_000_000u64);
        usdc_debt.debt_decimals = 6;
        let costs = calculate_costs(&usdc_debt).unwrap();
        assert_eq!(costs.simulated_profit_usd, dec!(100));
    }
}
