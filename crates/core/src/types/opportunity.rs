//! Validated liquidation candidates.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::position::Position;

/// Rejected by the [`Opportunity`] constructor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpportunityError {
    #[error("health factor {0} is not inside (0, 1)")]
    NotLiquidatable(Decimal),

    #[error("price snapshot must be positive")]
    NonPositivePrice,
}

/// A position that passed every detection filter, frozen together with the
/// price snapshot it was evaluated against. Immutable by construction;
/// `health_factor < 1` is a constructor invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    position: Position,
    health_factor: Decimal,
    collateral_price_usd: Decimal,
    debt_price_usd: Decimal,
    liquidation_bonus: Decimal,
    estimated_gross_profit_usd: Decimal,
    estimated_net_profit_usd: Decimal,
    detected_at_block: u64,
    detected_at: DateTime<Utc>,
}

impl Opportunity {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        position: Position,
        health_factor: Decimal,
        collateral_price_usd: Decimal,
        debt_price_usd: Decimal,
        liquidation_bonus: Decimal,
        estimated_gross_profit_usd: Decimal,
        estimated_net_profit_usd: Decimal,
        detected_at_block: u64,
        detected_at: DateTime<Utc>,
    ) -> Result<Self, OpportunityError> {
        if health_factor <= Decimal::ZERO || health_factor >= Decimal::ONE {
            return Err(OpportunityError::NotLiquidatable(health_factor));
        }
        if collateral_price_usd <= Decimal::ZERO || debt_price_usd <= Decimal::ZERO {
            return Err(OpportunityError::NonPositivePrice);
        }
        Ok(Self {
            position,
            health_factor,
            collateral_price_usd,
            debt_price_usd,
            liquidation_bonus,
            estimated_gross_profit_usd,
            estimated_net_profit_usd,
            detected_at_block,
            detected_at,
        })
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn health_factor(&self) -> Decimal {
        self.health_factor
    }

    pub fn collateral_price_usd(&self) -> Decimal {
        self.collateral_price_usd
    }

    pub fn debt_price_usd(&self) -> Decimal {
        self.debt_price_usd
    }

    pub fn liquidation_bonus(&self) -> Decimal {
        self.liquidation_bonus
    }

    pub fn estimated_gross_profit_usd(&self) -> Decimal {
        self.estimated_gross_profit_usd
    }

    pub fn estimated_net_profit_usd(&self) -> Decimal {
        self.estimated_net_profit_usd
    }

    pub fn detected_at_block(&self) -> u64 {
        self.detected_at_block
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, U256};
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position::new(
            "seamless",
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            U256::from(1u64),
            Address::repeat_byte(3),
            U256::from(1u64),
            dec!(0.80),
            10,
        )
        .unwrap()
    }

    #[test]
    fn rejects_healthy_position() {
        let err = Opportunity::new(
            position(),
            dec!(1.0),
            dec!(2000),
            dec!(1),
            dec!(0.05),
            dec!(100),
            dec!(40),
            10,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, OpportunityError::NotLiquidatable(dec!(1.0)));
    }

    #[test]
    fn accepts_unhealthy_position() {
        let opportunity = Opportunity::new(
            position(),
            dec!(0.93),
            dec!(2000),
            dec!(1),
            dec!(0.05),
            dec!(100),
            dec!(40),
            10,
            Utc::now(),
        )
        .unwrap();
        assert!(opportunity.health_factor() < Decimal::ONE);
        assert!(opportunity.health_factor() > Decimal::ZERO);
    }
}
