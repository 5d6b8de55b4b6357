//! Oracle gateway: Chainlink-style primary feeds, optional secondary
//! feeds, and the divergence / movement sanity checks.
//!
//! Feed decimals are fetched once per feed and cached. Sanity checks are
//! serialized per asset so the previous-price memory stays coherent, and
//! that memory only advances on a passing check.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::sol;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use liquidator_core::config::{AssetConfig, OracleConfig};
use liquidator_core::math;
use liquidator_core::traits::PriceOracle;

use crate::provider::{build_http, ProviderManager};

sol! {
    #[sol(rpc)]
    interface IAggregatorV3 {
        function latestRoundData() external view returns (
            uint80 roundId,
            int256 answer,
            uint256 startedAt,
            uint256 updatedAt,
            uint80 answeredInRound
        );

        function decimals() external view returns (uint8);
    }
}

/// Primary and optional secondary feed for one asset.
#[derive(Debug, Clone, Copy)]
struct FeedPair {
    primary: Address,
    secondary: Option<Address>,
}

/// Pure evaluation of the two sanity rules for one asset.
///
/// Divergence: `|primary - secondary| / primary <= max_divergence_percent`.
/// Movement: `|current - previous| / previous <= max_movement_percent`.
/// Both bounds are inclusive: a price exactly at the limit passes.
pub fn sanity_evaluate(
    primary: Decimal,
    secondary: Option<Decimal>,
    previous: Option<Decimal>,
    max_divergence_percent: Decimal,
    max_movement_percent: Decimal,
) -> bool {
    if primary <= Decimal::ZERO {
        return false;
    }

    if let Some(secondary) = secondary {
        let divergence = (primary - secondary).abs() / primary * Decimal::ONE_HUNDRED;
        if divergence > max_divergence_percent {
            return false;
        }
    }

    if let Some(previous) = previous {
        match math::percent_change(previous, primary) {
            Some(movement) if movement > max_movement_percent => return false,
            None => return false,
            _ => {}
        }
    }

    true
}

/// Gateway over all configured price feeds.
pub struct OracleGateway {
    provider: Arc<ProviderManager>,
    feeds: HashMap<Address, FeedPair>,
    decimals_cache: DashMap<Address, u8>,
    previous_prices: Mutex<HashMap<Address, Decimal>>,
    asset_locks: DashMap<Address, Arc<tokio::sync::Mutex<()>>>,
    max_divergence_percent: Decimal,
    max_movement_percent: Decimal,
    eth_usd_feed: Address,
    eth_usd_fallback: Decimal,
}

impl OracleGateway {
    pub fn new(
        provider: Arc<ProviderManager>,
        assets: &HashMap<Address, AssetConfig>,
        oracles: &OracleConfig,
    ) -> Self {
        let feeds = assets
            .iter()
            .map(|(asset, config)| {
                (*asset, FeedPair { primary: config.chainlink_feed, secondary: config.secondary_feed })
            })
            .collect();
        Self {
            provider,
            feeds,
            decimals_cache: DashMap::new(),
            previous_prices: Mutex::new(HashMap::new()),
            asset_locks: DashMap::new(),
            max_divergence_percent: oracles.max_divergence_percent,
            max_movement_percent: oracles.max_movement_percent,
            eth_usd_feed: oracles.eth_usd_feed,
            eth_usd_fallback: oracles.eth_usd_fallback,
        }
    }

    fn asset_lock(&self, asset: Address) -> Arc<tokio::sync::Mutex<()>> {
        self.asset_locks
            .entry(asset)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn feed_decimals(&self, feed: Address) -> Option<u8> {
        if let Some(decimals) = self.decimals_cache.get(&feed) {
            return Some(*decimals);
        }
        let provider = build_http(self.provider.primary_url()).ok()?;
        let contract = IAggregatorV3::new(feed, &provider);
        match contract.decimals().call().await {
            Ok(result) => {
                let decimals = result._0;
                self.decimals_cache.insert(feed, decimals);
                Some(decimals)
            }
            Err(e) => {
                warn!(feed = %feed, error = %e, "failed to fetch feed decimals");
                None
            }
        }
    }

    /// Fetch one feed's latest answer in USD. Stale rounds and
    /// non-positive answers report as missing.
    async fn feed_price(&self, feed: Address) -> Option<Decimal> {
        let decimals = self.feed_decimals(feed).await?;
        let provider = build_http(self.provider.primary_url()).ok()?;
        let contract = IAggregatorV3::new(feed, &provider);

        let round = match contract.latestRoundData().call().await {
            Ok(round) => round,
            Err(e) => {
                warn!(feed = %feed, error = %e, "latestRoundData failed");
                return None;
            }
        };

        if round.answer.is_negative() || round.answer.is_zero() {
            warn!(feed = %feed, "non-positive oracle answer");
            return None;
        }
        if round.updatedAt.is_zero() {
            warn!(feed = %feed, "round never updated");
            return None;
        }

        let raw: i128 = round.answer.try_into().ok()?;
        let price = Decimal::try_from_i128_with_scale(raw, decimals as u32).ok()?;
        debug!(feed = %feed, price = %price, "feed price");
        Some(price)
    }

    /// Run both sanity rules for one asset and, on success, advance its
    /// previous-price memory.
    async fn check_asset(&self, asset: Address, price: Decimal) -> bool {
        let lock = self.asset_lock(asset);
        let _guard = lock.lock().await;

        let secondary = match self.feeds.get(&asset).and_then(|f| f.secondary) {
            Some(feed) => self.feed_price(feed).await,
            None => None,
        };
        let previous = self.previous_prices.lock().get(&asset).copied();

        let passed = sanity_evaluate(
            price,
            secondary,
            previous,
            self.max_divergence_percent,
            self.max_movement_percent,
        );

        if passed {
            self.previous_prices.lock().insert(asset, price);
        } else {
            warn!(
                asset = %asset,
                price = %price,
                secondary = ?secondary,
                previous = ?previous,
                "oracle sanity check failed"
            );
        }
        passed
    }

    /// ETH/USD for the cost model, with the configured fallback when the
    /// feed is unreachable.
    pub async fn eth_usd(&self) -> Decimal {
        match self.feed_price(self.eth_usd_feed).await {
            Some(price) => price,
            None => {
                warn!(fallback = %self.eth_usd_fallback, "ETH/USD feed unavailable, using fallback");
                self.eth_usd_fallback
            }
        }
    }
}

#[async_trait]
impl PriceOracle for OracleGateway {
    async fn price(&self, asset: Address) -> Option<Decimal> {
        let feed = self.feeds.get(&asset)?.primary;
        self.feed_price(feed).await
    }

    async fn secondary_price(&self, asset: Address) -> Option<Decimal> {
        let feed = self.feeds.get(&asset)?.secondary?;
        self.feed_price(feed).await
    }

    async fn sanity_check(
        &self,
        asset_a: Address,
        price_a: Decimal,
        asset_b: Address,
        price_b: Decimal,
    ) -> bool {
        if !self.check_asset(asset_a, price_a).await {
            return false;
        }
        self.check_asset(asset_b, price_b).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn divergence_boundary_is_inclusive() {
        // Exactly 5% divergence passes.
        assert!(sanity_evaluate(dec!(100), Some(dec!(95)), None, dec!(5), dec!(30)));
        // Just over 5% fails.
        assert!(!sanity_evaluate(dec!(100), Some(dec!(94.99)), None, dec!(5), dec!(30)));
    }

    #[test]
    fn movement_boundary_is_inclusive() {
        // Exactly 30% movement passes.
        assert!(sanity_evaluate(dec!(130), None, Some(dec!(100)), dec!(5), dec!(30)));
        // Just over fails.
        assert!(!sanity_evaluate(dec!(130.01), None, Some(dec!(100)), dec!(5), dec!(30)));
    }

    #[test]
    fn no_secondary_and_no_history_passes() {
        assert!(sanity_evaluate(dec!(100), None, None, dec!(5), dec!(30)));
    }

    #[test]
    fn non_positive_primary_fails() {
        assert!(!sanity_evaluate(dec!(0), None, None, dec!(5), dec!(30)));
    }

    #[test]
    fn zero_previous_price_fails_closed() {
        assert!(!sanity_evaluate(dec!(100), None, Some(dec!(0)), dec!(5), dec!(30)));
    }
}
