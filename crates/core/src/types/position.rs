//! Borrower position mirrored from a lending market.

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation failures from the [`Position`] constructor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PositionError {
    #[error("protocol name is empty")]
    EmptyProtocol,

    #[error("liquidation threshold {0} outside (0, 1]")]
    ThresholdOutOfRange(Decimal),
}

/// One borrower's obligation inside one market, keyed by
/// `(protocol, user)`.
///
/// `blocks_unhealthy` counts consecutive blocks with health factor below
/// one; the cache's `update_health` is its sole writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Protocol name, e.g. "seamless" or "moonwell"
    pub protocol: String,
    /// Borrower wallet address
    pub user: Address,
    /// Collateral token address
    pub collateral_asset: Address,
    /// Collateral amount in the asset's smallest unit
    pub collateral_amount: U256,
    /// Debt token address
    pub debt_asset: Address,
    /// Debt amount in the asset's smallest unit
    pub debt_amount: U256,
    /// Protocol liquidation threshold as a fraction in (0, 1]
    pub liquidation_threshold: Decimal,
    /// Block of the most recent mutation (monotonic per identity)
    pub last_update_block: u64,
    /// Consecutive blocks observed with health factor < 1
    pub blocks_unhealthy: u32,
}

impl Position {
    /// Validating constructor. Invalid values are unrepresentable after
    /// this point.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        protocol: impl Into<String>,
        user: Address,
        collateral_asset: Address,
        collateral_amount: U256,
        debt_asset: Address,
        debt_amount: U256,
        liquidation_threshold: Decimal,
        last_update_block: u64,
    ) -> Result<Self, PositionError> {
        let protocol = protocol.into();
        if protocol.is_empty() {
            return Err(PositionError::EmptyProtocol);
        }
        if liquidation_threshold <= Decimal::ZERO || liquidation_threshold > Decimal::ONE {
            return Err(PositionError::ThresholdOutOfRange(liquidation_threshold));
        }
        Ok(Self {
            protocol,
            user,
            collateral_asset,
            collateral_amount,
            debt_asset,
            debt_amount,
            liquidation_threshold,
            last_update_block,
            blocks_unhealthy: 0,
        })
    }

    /// Cache key for this position: `position:{protocol}:{user}`.
    pub fn key(&self) -> String {
        Self::cache_key(&self.protocol, self.user)
    }

    /// Cache key for an arbitrary identity.
    pub fn cache_key(protocol: &str, user: Address) -> String {
        format!("position:{protocol}:{user:#x}")
    }

    /// True when the debt has been fully repaid and the entry should be
    /// dropped from the cache.
    pub fn is_closed(&self) -> bool {
        self.debt_amount.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> Position {
        Position::new(
            "seamless",
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            U256::from(10u64).pow(U256::from(18u64)),
            Address::repeat_byte(3),
            U256::from(400_000_000_000_000_000u128),
            dec!(0.80),
            100,
        )
        .unwrap()
    }

    #[test]
    fn constructor_rejects_bad_threshold() {
        let err = Position::new(
            "seamless",
            Address::ZERO,
            Address::ZERO,
            U256::ZERO,
            Address::ZERO,
            U256::ZERO,
            dec!(1.5),
            0,
        )
        .unwrap_err();
        assert_eq!(err, PositionError::ThresholdOutOfRange(dec!(1.5)));

        let err = Position::new(
            "",
            Address::ZERO,
            Address::ZERO,
            U256::ZERO,
            Address::ZERO,
            U256::ZERO,
            dec!(0.8),
            0,
        )
        .unwrap_err();
        assert_eq!(err, PositionError::EmptyProtocol);
    }

    #[test]
    fn json_round_trip_is_identity() {
        let position = sample();
        let json = serde_json::to_string(&position).unwrap();
        let decoded: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, position);
    }

    #[test]
    fn cache_key_is_stable() {
        let position = sample();
        assert!(position.key().starts_with("position:seamless:0x01"));
    }
}
