//! Audit rows, system events and rolling performance metrics.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::bundle::{Bundle, SubmissionPath};
use super::opportunity::Opportunity;

/// Operating state of the whole engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemState {
    Normal,
    Throttled,
    Halted,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Throttled => "THROTTLED",
            Self::Halted => "HALTED",
        }
    }

    /// Numeric encoding used by the metrics exporter.
    pub fn as_gauge(&self) -> f64 {
        match self {
            Self::Normal => 0.0,
            Self::Throttled => 1.0,
            Self::Halted => 2.0,
        }
    }
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal (or pending) classification of an execution decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Dropped before submission (limit violation, failed simulation, ...)
    Rejected,
    /// Submitted, inclusion not yet observed
    Pending,
    /// Observed in a block with a successful receipt
    Included,
    /// Observed in a block but the transaction reverted
    Reverted,
    /// Submitted but never observed within the inclusion window
    Expired,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rejected => "REJECTED",
            Self::Pending => "PENDING",
            Self::Included => "INCLUDED",
            Self::Reverted => "REVERTED",
            Self::Expired => "EXPIRED",
        }
    }
}

/// Immutable audit row written for every decision worth logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub block_number: u64,
    pub protocol: String,
    pub borrower: Address,
    pub collateral_asset: Address,
    pub debt_asset: Address,
    pub health_factor: Decimal,
    pub simulation_success: bool,
    pub simulated_profit_wei: Option<U256>,
    pub simulated_profit_usd: Option<Decimal>,
    pub bundle_submitted: bool,
    pub tx_hash: Option<B256>,
    pub submission_path: Option<SubmissionPath>,
    pub bribe_usd: Option<Decimal>,
    pub status: ExecutionStatus,
    pub included: bool,
    pub inclusion_block: Option<u64>,
    pub actual_profit_wei: Option<U256>,
    pub actual_profit_usd: Option<Decimal>,
    pub state_at_execution: SystemState,
    pub rejection_reason: Option<String>,
}

impl ExecutionRecord {
    /// Row for an opportunity dropped before or during simulation.
    pub fn rejection(
        opportunity: &Opportunity,
        state: SystemState,
        simulation_success: bool,
        reason: impl Into<String>,
    ) -> Self {
        let position = opportunity.position();
        Self {
            timestamp: Utc::now(),
            block_number: opportunity.detected_at_block(),
            protocol: position.protocol.clone(),
            borrower: position.user,
            collateral_asset: position.collateral_asset,
            debt_asset: position.debt_asset,
            health_factor: opportunity.health_factor(),
            simulation_success,
            simulated_profit_wei: None,
            simulated_profit_usd: None,
            bundle_submitted: false,
            tx_hash: None,
            submission_path: None,
            bribe_usd: None,
            status: ExecutionStatus::Rejected,
            included: false,
            inclusion_block: None,
            actual_profit_wei: None,
            actual_profit_usd: None,
            state_at_execution: state,
            rejection_reason: Some(reason.into()),
        }
    }

    /// Row for a bundle that reached the submission step.
    pub fn submitted(bundle: &Bundle, state: SystemState, tx_hash: Option<B256>) -> Self {
        let opportunity = bundle.opportunity();
        let position = opportunity.position();
        let submitted = tx_hash.is_some();
        Self {
            timestamp: Utc::now(),
            block_number: opportunity.detected_at_block(),
            protocol: position.protocol.clone(),
            borrower: position.user,
            collateral_asset: position.collateral_asset,
            debt_asset: position.debt_asset,
            health_factor: opportunity.health_factor(),
            simulation_success: true,
            simulated_profit_wei: Some(bundle.simulated_profit_wei()),
            simulated_profit_usd: Some(bundle.costs().simulated_profit_usd),
            bundle_submitted: submitted,
            tx_hash,
            submission_path: submitted.then(|| bundle.submission_path()),
            bribe_usd: Some(bundle.costs().bribe_usd),
            status: if submitted { ExecutionStatus::Pending } else { ExecutionStatus::Rejected },
            included: false,
            inclusion_block: None,
            actual_profit_wei: None,
            actual_profit_usd: None,
            state_at_execution: state,
            rejection_reason: None,
        }
    }

    /// Row for an observed inclusion outcome of a previously submitted
    /// bundle.
    pub fn outcome(
        bundle: &Bundle,
        state: SystemState,
        tx_hash: B256,
        status: ExecutionStatus,
        inclusion_block: Option<u64>,
        actual_profit_wei: Option<U256>,
        actual_profit_usd: Option<Decimal>,
    ) -> Self {
        let mut record = Self::submitted(bundle, state, Some(tx_hash));
        record.status = status;
        record.included = status == ExecutionStatus::Included;
        record.inclusion_block = inclusion_block;
        record.actual_profit_wei = actual_profit_wei;
        record.actual_profit_usd = actual_profit_usd;
        record
    }
}

/// Mismatch between a cached value and the canonical chain state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDivergence {
    pub timestamp: DateTime<Utc>,
    pub block_number: u64,
    pub protocol: String,
    pub user: Address,
    pub field: String,
    pub cached_value: U256,
    pub canonical_value: U256,
    pub divergence_bps: u64,
}

/// High-severity operational event (state transitions, limit violations,
/// manual interventions).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: String,
    pub message: String,
    pub context: serde_json::Value,
}

impl SystemEvent {
    pub fn new(
        event_type: impl Into<String>,
        severity: impl Into<String>,
        message: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            severity: severity.into(),
            message: message.into(),
            context,
        }
    }
}

/// Rolling window over the last 100 submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub timestamp: DateTime<Utc>,
    pub window_size: usize,
    pub total_submissions: usize,
    pub successful_inclusions: usize,
    pub inclusion_rate: Decimal,
    pub total_executions: usize,
    pub simulation_accuracy: Decimal,
    pub total_profit_usd: Decimal,
    pub average_profit_usd: Decimal,
    pub consecutive_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::position::Position;
    use rust_decimal_macros::dec;

    fn opportunity() -> Opportunity {
        let position = Position::new(
            "moonwell",
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            U256::from(5u64),
            Address::repeat_byte(3),
            U256::from(9u64),
            dec!(0.75),
            42,
        )
        .unwrap();
        Opportunity::new(
            position,
            dec!(0.85),
            dec!(1500),
            dec!(1),
            dec!(0.07),
            dec!(80),
            dec!(30),
            42,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn rejection_record_shape() {
        let record = ExecutionRecord::rejection(
            &opportunity(),
            SystemState::Normal,
            false,
            "revert: HF above one",
        );
        assert_eq!(record.status, ExecutionStatus::Rejected);
        assert!(!record.simulation_success);
        assert!(!record.bundle_submitted);
        assert!(record.rejection_reason.as_deref().unwrap().contains("revert"));
    }

    #[test]
    fn json_round_trip_is_identity() {
        let record = ExecutionRecord::rejection(
            &opportunity(),
            SystemState::Throttled,
            true,
            "insufficient_profit",
        );
        let json = serde_json::to_string(&record).unwrap();
        let decoded: ExecutionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn system_state_gauge_encoding() {
        assert_eq!(SystemState::Normal.as_gauge(), 0.0);
        assert_eq!(SystemState::Throttled.as_gauge(), 1.0);
        assert_eq!(SystemState::Halted.as_gauge(), 2.0);
    }
}
