//! Deterministic conversions between on-chain integer amounts and USD
//! decimals.
//!
//! On-chain amounts stay `U256` in the asset's smallest unit; everything
//! denominated in USD is a `rust_decimal::Decimal` (28 significant digits,
//! banker's rounding). Conversions go through the asset's real decimals, so
//! a 6-decimal stablecoin and an 18-decimal collateral both come out right.

use alloy::primitives::U256;
use rust_decimal::{Decimal, RoundingStrategy};

/// Basis points in one whole (100%).
pub const BPS_DENOMINATOR: u64 = 10_000;

/// USD values are carried with 8 fractional digits.
pub const USD_SCALE: u32 = 8;

/// Convert a raw token amount to a token-unit `Decimal` using the asset's
/// decimals. Returns `None` when the amount does not fit the 96-bit decimal
/// mantissa (no real-world position does).
pub fn token_units(amount: U256, decimals: u8) -> Option<Decimal> {
    if amount > U256::from(u128::MAX) {
        return None;
    }
    let raw = i128::try_from(amount.to::<u128>()).ok()?;
    Decimal::try_from_i128_with_scale(raw, decimals as u32).ok()
}

/// USD value of a raw token amount at the given per-unit price.
pub fn usd_value(amount: U256, decimals: u8, price_usd: Decimal) -> Option<Decimal> {
    let units = token_units(amount, decimals)?;
    units
        .checked_mul(price_usd)
        .map(|v| v.round_dp_with_strategy(USD_SCALE, RoundingStrategy::MidpointNearestEven))
}

/// Wei-denominated gas cost to USD at the given ETH/USD price.
pub fn wei_to_usd(wei: u128, eth_usd: Decimal) -> Decimal {
    let eth = i128::try_from(wei)
        .ok()
        .and_then(|w| Decimal::try_from_i128_with_scale(w, 18).ok())
        .unwrap_or_default();
    (eth * eth_usd).round_dp_with_strategy(USD_SCALE, RoundingStrategy::MidpointNearestEven)
}

/// Convert a USD value back into a raw token amount at the given price.
/// Used for the on-chain `min_profit` floor. Returns zero when the price is
/// zero or the value is non-positive.
pub fn usd_to_token_amount(value_usd: Decimal, decimals: u8, price_usd: Decimal) -> U256 {
    if price_usd <= Decimal::ZERO || value_usd <= Decimal::ZERO {
        return U256::ZERO;
    }
    let units = match value_usd.checked_div(price_usd) {
        Some(u) => u,
        None => return U256::ZERO,
    };
    // amount = units * 10^decimals, computed as exact integer math on the
    // decimal mantissa so the truncation is deterministic.
    let mantissa = U256::from(units.mantissa().unsigned_abs());
    let num = mantissa * U256::from(10u64).pow(U256::from(decimals as u64));
    num / U256::from(10u64).pow(U256::from(units.scale() as u64))
}

/// Divergence between a cached and a canonical value in basis points:
/// `|cached - canonical| * 10_000 / canonical`. Returns `None` when the
/// canonical value is zero (nothing to compare against).
pub fn divergence_bps(cached: U256, canonical: U256) -> Option<u64> {
    if canonical.is_zero() {
        return None;
    }
    let diff = if cached >= canonical { cached - canonical } else { canonical - cached };
    let bps = diff * U256::from(BPS_DENOMINATOR) / canonical;
    if bps > U256::from(u64::MAX) {
        Some(u64::MAX)
    } else {
        Some(bps.to::<u64>())
    }
}

/// Relative change `|current - previous| / previous` as a percentage.
/// Returns `None` when the previous value is zero.
pub fn percent_change(previous: Decimal, current: Decimal) -> Option<Decimal> {
    if previous.is_zero() {
        return None;
    }
    let diff = (current - previous).abs();
    diff.checked_div(previous.abs()).map(|r| r * Decimal::ONE_HUNDRED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn token_units_respects_decimals() {
        // 1000 USDC at 6 decimals
        let usdc = token_units(U256::from(1_000_000_000u64), 6).unwrap();
        assert_eq!(usdc, dec!(1000));

        // 1.5 WETH at 18 decimals
        let weth = token_units(U256::from(1_500_000_000_000_000_000u128), 18).unwrap();
        assert_eq!(weth, dec!(1.5));
    }

    #[test]
    fn usd_value_mixed_decimals() {
        // 2500 USDC (6 decimals) at $1.00
        let v = usd_value(U256::from(2_500_000_000u64), 6, dec!(1)).unwrap();
        assert_eq!(v, dec!(2500));

        // 1 WETH at $2000
        let v = usd_value(U256::from(10u64).pow(U256::from(18u64)), 18, dec!(2000)).unwrap();
        assert_eq!(v, dec!(2000));
    }

    #[test]
    fn wei_to_usd_gas_cost() {
        // 350_000 gas * 3 gwei = 1_050_000 gwei = 0.00105 ETH at $2000 = $2.10
        let cost = wei_to_usd(1_050_000_000_000_000, dec!(2000));
        assert_eq!(cost, dec!(2.10));
    }

    #[test]
    fn usd_to_token_amount_round_trip() {
        // $50 of an 18-decimal $1 asset is 50e18
        let amount = usd_to_token_amount(dec!(50), 18, dec!(1));
        assert_eq!(amount, U256::from(50u64) * U256::from(10u64).pow(U256::from(18u64)));

        // $50 of a 6-decimal $1 asset is 50e6
        let amount = usd_to_token_amount(dec!(50), 6, dec!(1));
        assert_eq!(amount, U256::from(50_000_000u64));
    }

    #[test]
    fn divergence_bps_matches_spec() {
        // cached 1.00e18, canonical 1.02e18 -> 196 bps
        let cached = U256::from(1_000_000_000_000_000_000u128);
        let canonical = U256::from(1_020_000_000_000_000_000u128);
        assert_eq!(divergence_bps(cached, canonical), Some(196));

        // Equal values diverge by zero
        assert_eq!(divergence_bps(canonical, canonical), Some(0));

        // Zero canonical has no defined divergence
        assert_eq!(divergence_bps(cached, U256::ZERO), None);
    }

    #[test]
    fn percent_change_symmetry() {
        assert_eq!(percent_change(dec!(100), dec!(130)), Some(dec!(30)));
        assert_eq!(percent_change(dec!(100), dec!(70)), Some(dec!(30)));
        assert_eq!(percent_change(dec!(0), dec!(70)), None);
    }
}
