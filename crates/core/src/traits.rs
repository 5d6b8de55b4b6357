//! Seams between the detection logic and its collaborators.
//!
//! The chain and store crates implement these; tests substitute static
//! fixtures. The detector never holds a pointer back to the orchestrator.

use alloy::primitives::Address;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::{CacheError, DatabaseError};
use crate::types::{ExecutionRecord, PerformanceMetrics, Position, StateDivergence, SystemEvent};

/// Read side of the oracle gateway.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Primary-feed price in USD; `None` means the caller cannot evaluate.
    async fn price(&self, asset: Address) -> Option<Decimal>;

    /// Secondary-feed price in USD, when a secondary feed exists.
    async fn secondary_price(&self, asset: Address) -> Option<Decimal>;

    /// Multi-oracle and movement sanity check over a pair of freshly
    /// fetched prices. The previous-price memory updates only on a passing
    /// check.
    async fn sanity_check(
        &self,
        asset_a: Address,
        price_a: Decimal,
        asset_b: Address,
        price_b: Decimal,
    ) -> bool;
}

/// Protocol-level execution guards.
#[async_trait]
pub trait ProtocolGuard: Send + Sync {
    /// True when the protocol currently allows liquidations.
    async fn liquidation_allowed(&self, protocol: &str) -> bool;
}

/// Mutating view of the position cache used by the detector and the block
/// processor.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn get(&self, protocol: &str, user: Address) -> Option<Position>;

    async fn list_all(&self) -> Vec<Position>;

    async fn upsert(&self, position: Position) -> Result<(), CacheError>;

    /// Sole writer of `blocks_unhealthy`: resets to zero on healthy,
    /// increments on unhealthy. Returns the updated position.
    async fn update_health(
        &self,
        protocol: &str,
        user: Address,
        is_healthy: bool,
        block: u64,
    ) -> Result<Option<Position>, CacheError>;

    async fn remove(&self, protocol: &str, user: Address) -> Result<(), CacheError>;
}

/// Durable sink for audit rows. Implementations queue in memory while the
/// backing store is unreachable; callers never fail a trading decision on a
/// sink error.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError>;

    async fn record_divergence(&self, divergence: &StateDivergence) -> Result<(), DatabaseError>;

    async fn record_metrics(&self, metrics: &PerformanceMetrics) -> Result<(), DatabaseError>;

    async fn record_event(&self, event: &SystemEvent) -> Result<(), DatabaseError>;
}

/// Sink that drops everything. Used by tests and as a stand-in before the
/// durable store is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn record_execution(&self, _record: &ExecutionRecord) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn record_divergence(&self, _divergence: &StateDivergence) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn record_metrics(&self, _metrics: &PerformanceMetrics) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn record_event(&self, _event: &SystemEvent) -> Result<(), DatabaseError> {
        Ok(())
    }
}
