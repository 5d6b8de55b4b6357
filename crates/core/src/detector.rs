//! Liquidation opportunity detection.
//!
//! Each position runs through an ordered, fail-closed filter: health
//! factor, multi-oracle sanity, confirmation blocks, protocol state and a
//! rough profit estimate. Only positions that clear every stage become an
//! [`Opportunity`].

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::BotConfig;
use crate::math;
use crate::traits::{PositionStore, PriceOracle, ProtocolGuard};
use crate::types::{Opportunity, Position};

/// Assumed arbitrage upside on seized collateral (3%).
fn arbitrage_fraction() -> Decimal {
    Decimal::new(3, 2)
}

/// Fixed gas assumption used by the pre-estimate, in USD. The planner
/// replaces this with the real L2+L1 model after simulation.
fn pre_estimate_gas_usd() -> Decimal {
    Decimal::from(15)
}

/// Bribe assumption used by the pre-estimate (20% of gross).
fn pre_estimate_bribe_fraction() -> Decimal {
    Decimal::new(20, 2)
}

/// Health factor for a position given both prices and per-asset decimals.
///
/// `H = collateral_units * price_c * threshold / (debt_units * price_d)`.
/// Returns `None` when an amount overflows the decimal range; a zero-debt
/// position reports `None` too and is treated as healthy by the caller.
pub fn health_factor(
    position: &Position,
    collateral_price: Decimal,
    debt_price: Decimal,
    collateral_decimals: u8,
    debt_decimals: u8,
) -> Option<Decimal> {
    if position.debt_amount.is_zero() {
        return None;
    }
    let collateral_value =
        math::usd_value(position.collateral_amount, collateral_decimals, collateral_price)?;
    let debt_value = math::usd_value(position.debt_amount, debt_decimals, debt_price)?;
    if debt_value.is_zero() {
        return None;
    }
    (collateral_value * position.liquidation_threshold).checked_div(debt_value)
}

/// Gross/net profit pre-estimate used to discard obviously unprofitable
/// candidates before spending a simulation on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfitEstimate {
    pub gross_usd: Decimal,
    pub net_usd: Decimal,
}

/// Rough profit estimate from the price snapshot alone.
pub fn estimate_profit(
    collateral_value_usd: Decimal,
    debt_value_usd: Decimal,
    liquidation_bonus: Decimal,
    flash_loan_premium_percent: Decimal,
    max_slippage_percent: Decimal,
) -> ProfitEstimate {
    let bonus = collateral_value_usd * liquidation_bonus;
    let arbitrage = collateral_value_usd * arbitrage_fraction();
    let gross = bonus + arbitrage;

    let bribe = gross * pre_estimate_bribe_fraction();
    let flash = debt_value_usd * flash_loan_premium_percent / Decimal::ONE_HUNDRED;
    let slippage = collateral_value_usd * max_slippage_percent / Decimal::ONE_HUNDRED;
    let costs = pre_estimate_gas_usd() + bribe + flash + slippage;

    ProfitEstimate { gross_usd: gross, net_usd: gross - costs }
}

/// Multi-layer opportunity detector over the position cache.
pub struct OpportunityDetector {
    config: Arc<BotConfig>,
    store: Arc<dyn PositionStore>,
    oracle: Arc<dyn PriceOracle>,
    guard: Arc<dyn ProtocolGuard>,
}

impl OpportunityDetector {
    pub fn new(
        config: Arc<BotConfig>,
        store: Arc<dyn PositionStore>,
        oracle: Arc<dyn PriceOracle>,
        guard: Arc<dyn ProtocolGuard>,
    ) -> Self {
        Self { config, store, oracle, guard }
    }

    /// Run the full filter over one position at the given block. Returns an
    /// opportunity only when every stage passes; every rejection path
    /// fails closed.
    pub async fn check_position(
        &self,
        position: &Position,
        current_block: u64,
    ) -> Option<Opportunity> {
        let protocol = position.protocol.as_str();
        let user = position.user;

        // Unknown assets cannot be evaluated.
        let collateral_decimals = self.config.asset_decimals(position.collateral_asset)?;
        let debt_decimals = self.config.asset_decimals(position.debt_asset)?;

        // Step 1: health factor. Missing prices drop the position without
        // touching blocks_unhealthy.
        let collateral_price = match self.oracle.price(position.collateral_asset).await {
            Some(p) => p,
            None => {
                debug!(protocol, user = %user, "no collateral price, skipping");
                return None;
            }
        };
        let debt_price = match self.oracle.price(position.debt_asset).await {
            Some(p) => p,
            None => {
                debug!(protocol, user = %user, "no debt price, skipping");
                return None;
            }
        };

        let hf = match health_factor(
            position,
            collateral_price,
            debt_price,
            collateral_decimals,
            debt_decimals,
        ) {
            Some(hf) => hf,
            None => {
                // Zero debt: the position is trivially healthy.
                let _ = self
                    .store
                    .update_health(protocol, user, true, current_block)
                    .await;
                return None;
            }
        };

        if hf >= Decimal::ONE {
            if let Err(e) = self.store.update_health(protocol, user, true, current_block).await {
                warn!(protocol, user = %user, error = %e, "failed to reset health counter");
            }
            return None;
        }

        info!(
            protocol,
            user = %user,
            health_factor = %hf,
            block = current_block,
            "unhealthy position detected"
        );

        // Step 2: oracle sanity. Suspect data must not accrue toward the
        // confirmation count.
        if !self
            .oracle
            .sanity_check(position.collateral_asset, collateral_price, position.debt_asset, debt_price)
            .await
        {
            warn!(protocol, user = %user, "oracle sanity check failed, skipping");
            return None;
        }

        // Step 3: confirmation blocks.
        let updated = match self.store.update_health(protocol, user, false, current_block).await {
            Ok(Some(p)) => p,
            Ok(None) => return None,
            Err(e) => {
                warn!(protocol, user = %user, error = %e, "failed to advance health counter");
                return None;
            }
        };

        if updated.blocks_unhealthy < self.config.confirmation_blocks {
            debug!(
                protocol,
                user = %user,
                blocks_unhealthy = updated.blocks_unhealthy,
                required = self.config.confirmation_blocks,
                "confirmation blocks not yet met"
            );
            return None;
        }

        // Step 4: protocol state.
        if !self.guard.liquidation_allowed(protocol).await {
            warn!(protocol, user = %user, "protocol pause check failed, skipping");
            return None;
        }

        // Step 5: rough profit estimate.
        let protocol_config = self.config.protocols.get(protocol)?;
        let collateral_value =
            math::usd_value(updated.collateral_amount, collateral_decimals, collateral_price)?;
        let debt_value = math::usd_value(updated.debt_amount, debt_decimals, debt_price)?;

        let estimate = estimate_profit(
            collateral_value,
            debt_value,
            protocol_config.liquidation_bonus,
            self.config.execution.flash_loan_premium_percent,
            self.config.dex.max_slippage_percent,
        );

        if estimate.net_usd < self.config.safety.min_profit_usd {
            debug!(
                protocol,
                user = %user,
                estimated_net = %estimate.net_usd,
                minimum = %self.config.safety.min_profit_usd,
                "estimated profit below minimum"
            );
            return None;
        }

        let opportunity = Opportunity::new(
            updated,
            hf,
            collateral_price,
            debt_price,
            protocol_config.liquidation_bonus,
            estimate.gross_usd,
            estimate.net_usd,
            current_block,
            Utc::now(),
        );

        match opportunity {
            Ok(opportunity) => {
                info!(
                    protocol,
                    user = %user,
                    health_factor = %hf,
                    estimated_net_usd = %estimate.net_usd,
                    "opportunity detected"
                );
                Some(opportunity)
            }
            Err(e) => {
                warn!(protocol, user = %user, error = %e, "opportunity construction rejected");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use alloy::primitives::{Address, U256};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct StaticOracle {
        prices: HashMap<Address, Decimal>,
        sanity_passes: bool,
    }

    #[async_trait]
    impl PriceOracle for StaticOracle {
        async fn price(&self, asset: Address) -> Option<Decimal> {
            self.prices.get(&asset).copied()
        }

        async fn secondary_price(&self, _asset: Address) -> Option<Decimal> {
            None
        }

        async fn sanity_check(
            &self,
            _a: Address,
            _pa: Decimal,
            _b: Address,
            _pb: Decimal,
        ) -> bool {
            self.sanity_passes
        }
    }

    struct AllowAll;

    #[async_trait]
    impl ProtocolGuard for AllowAll {
        async fn liquidation_allowed(&self, _protocol: &str) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct MemStore {
        positions: Mutex<HashMap<String, Position>>,
    }

    impl MemStore {
        fn with(position: Position) -> Arc<Self> {
            let store = Self::default();
            store.positions.lock().insert(position.key(), position);
            Arc::new(store)
        }
    }

    #[async_trait]
    impl PositionStore for MemStore {
        async fn get(&self, protocol: &str, user: Address) -> Option<Position> {
            self.positions.lock().get(&Position::cache_key(protocol, user)).cloned()
        }

        async fn list_all(&self) -> Vec<Position> {
            self.positions.lock().values().cloned().collect()
        }

        async fn upsert(&self, position: Position) -> Result<(), CacheError> {
            self.positions.lock().insert(position.key(), position);
            Ok(())
        }

        async fn update_health(
            &self,
            protocol: &str,
            user: Address,
            is_healthy: bool,
            block: u64,
        ) -> Result<Option<Position>, CacheError> {
            let mut positions = self.positions.lock();
            let Some(position) = positions.get_mut(&Position::cache_key(protocol, user)) else {
                return Ok(None);
            };
            if is_healthy {
                position.blocks_unhealthy = 0;
            } else {
                position.blocks_unhealthy += 1;
            }
            position.last_update_block = block;
            Ok(Some(position.clone()))
        }

        async fn remove(&self, protocol: &str, user: Address) -> Result<(), CacheError> {
            self.positions.lock().remove(&Position::cache_key(protocol, user));
            Ok(())
        }
    }

    fn weth() -> Address {
        "0x4200000000000000000000000000000000000006".parse().unwrap()
    }

    fn usdc() -> Address {
        "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913".parse().unwrap()
    }

    fn dai() -> Address {
        "0x50c5725949a6f0c72e6c4a641f24049a917db0cb".parse().unwrap()
    }

    fn pool() -> Address {
        "0x8f44fd754285aa6a2b8b9b97739b79746e0475a7".parse().unwrap()
    }

    fn config() -> Arc<BotConfig> {
        let yaml = format!(
            r#"
rpc:
  primary_http: "http://primary"
  backup_http: "http://backup"
  primary_ws: "ws://primary"
  backup_ws: "ws://backup"
  archive_http: "http://archive"
protocols:
  seamless:
    address: "{pool}"
    liquidation_threshold: "0.80"
    liquidation_bonus: "0.05"
    aave_style: true
assets:
  "{weth}":
    symbol: WETH
    decimals: 18
    chainlink_feed: "0x71041dddad3595f9ced3dccfbe3d1f4b0a16bb70"
  "{usdc}":
    symbol: USDC
    decimals: 6
    chainlink_feed: "0x7e860098f58bbfc8648a4311b374b1d669a2bc6b"
  "{dai}":
    symbol: DAI
    decimals: 18
    chainlink_feed: "0x591e79239a7d679378ec8c847e5038150364c78f"
oracles:
  eth_usd_feed: "0x71041dddad3595f9ced3dccfbe3d1f4b0a16bb70"
execution:
  executor_contract: "0x1111111111111111111111111111111111111111"
safety:
  min_profit_usd: "50"
"#,
            pool = pool(),
            weth = weth(),
            usdc = usdc(),
            dai = dai(),
        );
        Arc::new(serde_yaml::from_str(&yaml).unwrap())
    }

    fn oracle(collateral_usd: Decimal, debt_usd: Decimal, sanity: bool) -> Arc<StaticOracle> {
        let mut prices = HashMap::new();
        prices.insert(weth(), collateral_usd);
        prices.insert(usdc(), debt_usd);
        Arc::new(StaticOracle { prices, sanity_passes: sanity })
    }

    fn position(collateral_wei: U256, debt_units: U256) -> Position {
        Position::new(
            "seamless",
            Address::repeat_byte(0xAB),
            weth(),
            collateral_wei,
            usdc(),
            debt_units,
            dec!(0.80),
            100,
        )
        .unwrap()
    }

    fn detector(
        store: Arc<MemStore>,
        oracle: Arc<StaticOracle>,
    ) -> OpportunityDetector {
        OpportunityDetector::new(config(), store, oracle, Arc::new(AllowAll))
    }

    #[test]
    fn health_factor_uses_asset_decimals() {
        // 1 WETH collateral at $2000, 400 USDC debt (6 decimals) at $1:
        // H = 2000 * 0.80 / 400 = 4.0. A hard-coded 1e18 conversion for
        // USDC would get this wrong by 12 orders of magnitude.
        let position = position(
            U256::from(10u64).pow(U256::from(18u64)),
            U256::from(400_000_000u64),
        );
        let hf = health_factor(&position, dec!(2000), dec!(1), 18, 6).unwrap();
        assert_eq!(hf, dec!(4));
    }

    #[tokio::test]
    async fn healthy_position_is_ignored_and_counter_reset() {
        // H = (1e18/1e18) * 2000 * 0.8 / ((4e17/1e18) * 1) = 4000
        let mut p = position(
            U256::from(10u64).pow(U256::from(18u64)),
            U256::from(400_000_000_000_000_000u128),
        );
        p.debt_asset = dai(); // 18-decimal $1 debt for this scenario
        p.blocks_unhealthy = 5;
        let store = MemStore::with(p.clone());
        let mut prices = HashMap::new();
        prices.insert(weth(), dec!(2000));
        prices.insert(dai(), dec!(1));
        let oracle = Arc::new(StaticOracle { prices, sanity_passes: true });
        let detector = detector(store.clone(), oracle);

        let result = detector.check_position(&p, 101).await;
        assert!(result.is_none());

        let stored = store.get("seamless", p.user).await.unwrap();
        assert_eq!(stored.blocks_unhealthy, 0);
    }

    #[tokio::test]
    async fn health_factor_exactly_one_is_not_liquidatable() {
        // 1 WETH at $2000, LT 0.80 -> risk-adjusted $1600; 1600 USDC debt.
        let p = position(
            U256::from(10u64).pow(U256::from(18u64)),
            U256::from(1_600_000_000u64),
        );
        let store = MemStore::with(p.clone());
        let detector = detector(store.clone(), oracle(dec!(2000), dec!(1), true));

        assert!(detector.check_position(&p, 101).await.is_none());
        let stored = store.get("seamless", p.user).await.unwrap();
        assert_eq!(stored.blocks_unhealthy, 0);
    }

    #[tokio::test]
    async fn missing_price_does_not_touch_counter() {
        let mut p = position(
            U256::from(10u64).pow(U256::from(18u64)),
            U256::from(10_000_000_000u64),
        );
        p.blocks_unhealthy = 1;
        let store = MemStore::with(p.clone());
        let mut prices = HashMap::new();
        prices.insert(weth(), dec!(2000)); // no debt price
        let oracle = Arc::new(StaticOracle { prices, sanity_passes: true });
        let detector = detector(store.clone(), oracle);

        assert!(detector.check_position(&p, 101).await.is_none());
        let stored = store.get("seamless", p.user).await.unwrap();
        assert_eq!(stored.blocks_unhealthy, 1);
    }

    #[tokio::test]
    async fn sanity_failure_does_not_advance_counter() {
        let p = position(
            U256::from(10u64).pow(U256::from(18u64)),
            U256::from(10_000_000_000u64), // $10k debt vs $1600 adjusted
        );
        let store = MemStore::with(p.clone());
        let detector = detector(store.clone(), oracle(dec!(2000), dec!(1), false));

        assert!(detector.check_position(&p, 101).await.is_none());
        let stored = store.get("seamless", p.user).await.unwrap();
        assert_eq!(stored.blocks_unhealthy, 0);
    }

    #[tokio::test]
    async fn confirmation_blocks_gate_emission() {
        // Large position so the profit estimate clears $50 comfortably:
        // 100 WETH at $2000 = $200k collateral, $170k debt -> H ~ 0.94.
        let p = position(
            U256::from(100u64) * U256::from(10u64).pow(U256::from(18u64)),
            U256::from(170_000_000_000u64),
        );
        let store = MemStore::with(p.clone());
        let detector = detector(store.clone(), oracle(dec!(2000), dec!(1), true));

        // Block N: counter goes 0 -> 1, confirmation (2) not met.
        assert!(detector.check_position(&p, 101).await.is_none());
        let after_first = store.get("seamless", p.user).await.unwrap();
        assert_eq!(after_first.blocks_unhealthy, 1);

        // Block N+1: counter goes 1 -> 2, opportunity emitted.
        let opportunity = detector.check_position(&after_first, 102).await.unwrap();
        assert_eq!(opportunity.position().blocks_unhealthy, 2);
        assert!(opportunity.health_factor() < Decimal::ONE);
        assert!(opportunity.health_factor() > Decimal::ZERO);
        assert_eq!(opportunity.detected_at_block(), 102);
    }

    #[tokio::test]
    async fn profit_gate_drops_small_positions() {
        // 0.01 WETH collateral: bonus + arb is pennies, far below $50.
        let p = position(
            U256::from(10_000_000_000_000_000u64),
            U256::from(17_000_000u64),
        );
        let store = MemStore::with(p.clone());
        let detector = detector(store.clone(), oracle(dec!(2000), dec!(1), true));

        assert!(detector.check_position(&p, 101).await.is_none());
        assert!(detector.check_position(&p, 102).await.is_none());
        // Counter still advanced: the rejection was economic, not oracle.
        let stored = store.get("seamless", p.user).await.unwrap();
        assert_eq!(stored.blocks_unhealthy, 2);
    }

    #[test]
    fn profit_estimate_matches_hand_calculation() {
        // $10_000 collateral, $8_500 debt, 5% bonus, 0.09% flash, 1% slip.
        let estimate = estimate_profit(dec!(10000), dec!(8500), dec!(0.05), dec!(0.09), dec!(1));
        // gross = 500 + 300 = 800
        assert_eq!(estimate.gross_usd, dec!(800));
        // costs = 15 + 160 + 7.65 + 100 = 282.65
        assert_eq!(estimate.net_usd, dec!(800) - dec!(282.65));
    }
}
