//! Safety controller: the outermost gate on all outbound activity.
//!
//! Maintains the NORMAL / THROTTLED / HALTED state machine, enforces the
//! operator's limits, and keeps the rolling performance window that drives
//! automatic transitions. HALTED exits only through an operator-issued
//! manual resume.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::SafetyConfig;
use crate::error::SafetyError;
use crate::traits::AuditSink;
use crate::types::{
    Bundle, ExecutionRecord, ExecutionStatus, PerformanceMetrics, SystemEvent, SystemState,
};

/// Rolling window length for both histories.
const WINDOW_SIZE: usize = 100;

/// Minimum samples before a rate drives an automatic transition.
const MIN_SAMPLES: usize = 10;

/// Cached metrics are considered fresh for this long.
const METRICS_TTL_SECS: i64 = 600;

/// One submitted bundle in the rolling window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionSample {
    pub timestamp: DateTime<Utc>,
    pub included: bool,
}

/// One included execution in the rolling window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSample {
    pub timestamp: DateTime<Utc>,
    pub simulated_profit_usd: Decimal,
    pub actual_profit_usd: Decimal,
}

struct Inner {
    state: SystemState,
    consecutive_failures: u32,
    daily_volume_usd: Decimal,
    daily_reset_at: DateTime<Utc>,
    submission_history: VecDeque<SubmissionSample>,
    execution_history: VecDeque<ExecutionSample>,
    cached_metrics: Option<PerformanceMetrics>,
    rng: StdRng,
}

/// Three-state risk machine governing every submission.
pub struct SafetyController {
    limits: SafetyConfig,
    sink: Arc<dyn AuditSink>,
    inner: Mutex<Inner>,
}

impl SafetyController {
    pub fn new(limits: SafetyConfig, sink: Arc<dyn AuditSink>) -> Self {
        let rng = match limits.throttle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let controller = Self {
            limits,
            sink,
            inner: Mutex::new(Inner {
                state: SystemState::Normal,
                consecutive_failures: 0,
                daily_volume_usd: Decimal::ZERO,
                daily_reset_at: next_midnight_utc(Utc::now()),
                submission_history: VecDeque::with_capacity(WINDOW_SIZE),
                execution_history: VecDeque::with_capacity(WINDOW_SIZE),
                cached_metrics: None,
                rng,
            }),
        };
        info!(state = %SystemState::Normal, "safety controller initialized");
        controller
    }

    pub fn current_state(&self) -> SystemState {
        self.inner.lock().state
    }

    /// Execution gate: NORMAL always passes, THROTTLED passes half the
    /// time (seeded PRNG), HALTED never passes.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            SystemState::Normal => true,
            SystemState::Throttled => inner.rng.gen_bool(0.5),
            SystemState::Halted => false,
        }
    }

    /// Transition to a new state, logging and persisting the event.
    /// Entering HALTED raises a CRITICAL alert.
    pub async fn transition(&self, new_state: SystemState, reason: &str) {
        let event = {
            let mut inner = self.inner.lock();
            if inner.state == new_state {
                return;
            }
            let old_state = inner.state;
            inner.state = new_state;
            let severity = if new_state == SystemState::Halted { "CRITICAL" } else { "HIGH" };
            SystemEvent::new(
                "state_transition",
                severity,
                format!("state transition: {old_state} -> {new_state}"),
                json!({
                    "old_state": old_state.as_str(),
                    "new_state": new_state.as_str(),
                    "reason": reason,
                }),
            )
        };

        if new_state == SystemState::Halted {
            error!(reason, new_state = %new_state, "ALERT: system halted");
        } else {
            warn!(reason, new_state = %new_state, "state transition");
        }
        metrics::gauge!("liquidator_system_state").set(new_state.as_gauge());

        if let Err(e) = self.sink.record_event(&event).await {
            warn!(error = %e, "failed to persist state transition event");
        }
    }

    /// Operator-issued recovery from HALTED. Resets the consecutive
    /// failure counter; a no-op in any other state.
    pub async fn manual_resume(&self, operator: &str, reason: &str) -> bool {
        let event = {
            let mut inner = self.inner.lock();
            if inner.state != SystemState::Halted {
                warn!(state = %inner.state, "manual resume ignored: system is not halted");
                return false;
            }
            inner.state = SystemState::Normal;
            inner.consecutive_failures = 0;
            SystemEvent::new(
                "manual_resume",
                "HIGH",
                format!("manual resume by {operator}"),
                json!({ "operator": operator, "reason": reason }),
            )
        };

        info!(operator, reason, "system manually resumed");
        metrics::gauge!("liquidator_system_state").set(SystemState::Normal.as_gauge());

        if let Err(e) = self.sink.record_event(&event).await {
            warn!(error = %e, "failed to persist manual resume event");
        }
        true
    }

    /// Validate a candidate bundle against every limit. The daily cap is
    /// boundary-inclusive: a candidate that lands exactly on the cap is
    /// accepted.
    pub async fn validate_execution(&self, bundle: &Bundle) -> Result<(), SafetyError> {
        let violation = {
            let mut inner = self.inner.lock();
            reset_daily_if_needed(&mut inner, Utc::now());

            let net = bundle.net_profit_usd();
            if net < self.limits.min_profit_usd {
                Some(SafetyError::BelowMinProfit {
                    net: net.to_string(),
                    min: self.limits.min_profit_usd.to_string(),
                })
            } else if net > self.limits.max_single_execution_usd {
                Some(SafetyError::SingleExecutionCap {
                    net: net.to_string(),
                    cap: self.limits.max_single_execution_usd.to_string(),
                })
            } else if inner.daily_volume_usd + net > self.limits.max_daily_volume_usd {
                Some(SafetyError::DailyVolumeCap {
                    projected: (inner.daily_volume_usd + net).to_string(),
                    cap: self.limits.max_daily_volume_usd.to_string(),
                })
            } else if inner.consecutive_failures >= self.limits.max_consecutive_failures {
                Some(SafetyError::ConsecutiveFailures(inner.consecutive_failures))
            } else {
                None
            }
        };

        if let Some(violation) = violation {
            let position = bundle.opportunity().position();
            let event = SystemEvent::new(
                "limit_violation",
                "MEDIUM",
                violation.to_string(),
                json!({
                    "protocol": position.protocol,
                    "user": format!("{:#x}", position.user),
                    "net_profit_usd": bundle.net_profit_usd().to_string(),
                }),
            );
            info!(reason = %violation, "execution rejected by limit");
            if let Err(e) = self.sink.record_event(&event).await {
                warn!(error = %e, "failed to persist limit violation event");
            }
            return Err(violation);
        }
        Ok(())
    }

    /// Record an execution outcome and advance the counters.
    ///
    /// Included outcomes reset the failure streak, enter both windows and
    /// add realized profit to the daily volume. Submitted-but-not-included
    /// outcomes (expired or reverted on-chain) extend the failure streak
    /// and enter the submission window only. Everything else is an audit
    /// row with no counter effect.
    pub async fn record_execution(&self, record: &ExecutionRecord) {
        {
            let mut inner = self.inner.lock();
            reset_daily_if_needed(&mut inner, Utc::now());

            match record.status {
                ExecutionStatus::Included => {
                    inner.consecutive_failures = 0;
                    push_bounded(
                        &mut inner.submission_history,
                        SubmissionSample { timestamp: record.timestamp, included: true },
                    );
                    let simulated = record.simulated_profit_usd.unwrap_or_default();
                    let actual = record.actual_profit_usd.unwrap_or_default();
                    push_bounded(
                        &mut inner.execution_history,
                        ExecutionSample {
                            timestamp: record.timestamp,
                            simulated_profit_usd: simulated,
                            actual_profit_usd: actual,
                        },
                    );
                    inner.daily_volume_usd += actual;
                }
                ExecutionStatus::Expired | ExecutionStatus::Reverted
                    if record.bundle_submitted =>
                {
                    inner.consecutive_failures += 1;
                    push_bounded(
                        &mut inner.submission_history,
                        SubmissionSample { timestamp: record.timestamp, included: false },
                    );
                }
                _ => {}
            }

            metrics::gauge!("liquidator_consecutive_failures")
                .set(inner.consecutive_failures as f64);
            info!(
                status = record.status.as_str(),
                included = record.included,
                consecutive_failures = inner.consecutive_failures,
                "execution recorded"
            );
        }

        if let Err(e) = self.sink.record_execution(record).await {
            warn!(error = %e, "failed to persist execution record");
        }
    }

    /// Compute (or return cached) rolling performance metrics. The cache
    /// is valid for ten minutes; `force` recomputes unconditionally.
    pub async fn calculate_metrics(&self, force: bool) -> PerformanceMetrics {
        let metrics_value = {
            let mut inner = self.inner.lock();
            let now = Utc::now();

            if !force {
                if let Some(cached) = &inner.cached_metrics {
                    if now - cached.timestamp < ChronoDuration::seconds(METRICS_TTL_SECS) {
                        return cached.clone();
                    }
                }
            }

            let computed = compute_metrics(&inner, now);
            inner.cached_metrics = Some(computed.clone());
            computed
        };

        if let Err(e) = self.sink.record_metrics(&metrics_value).await {
            warn!(error = %e, "failed to persist performance metrics");
        }
        metrics_value
    }

    /// Evaluate the automatic transition rules against fresh metrics.
    /// HALTED is sticky: it is never left automatically.
    pub async fn check_and_apply_transitions(&self) {
        let metrics_value = self.calculate_metrics(true).await;
        let current = self.current_state();

        if current == SystemState::Halted {
            return;
        }

        if let Some(reason) = self.halt_reason(&metrics_value) {
            self.transition(SystemState::Halted, &reason).await;
            return;
        }

        match current {
            SystemState::Normal => {
                if let Some(reason) = self.throttle_reason(&metrics_value) {
                    self.transition(SystemState::Throttled, &reason).await;
                }
            }
            SystemState::Throttled => {
                if self.recovered(&metrics_value) {
                    self.transition(
                        SystemState::Normal,
                        "performance recovered: inclusion and accuracy above thresholds",
                    )
                    .await;
                }
            }
            SystemState::Halted => {}
        }
    }

    fn halt_reason(&self, m: &PerformanceMetrics) -> Option<String> {
        if m.consecutive_failures >= self.limits.max_consecutive_failures {
            return Some(format!("consecutive failures = {}", m.consecutive_failures));
        }
        if m.total_submissions >= MIN_SAMPLES && m.inclusion_rate < self.limits.halt_inclusion_rate
        {
            return Some(format!("inclusion rate = {}", m.inclusion_rate));
        }
        if m.total_executions >= MIN_SAMPLES
            && m.simulation_accuracy < self.limits.halt_accuracy
        {
            return Some(format!("simulation accuracy = {}", m.simulation_accuracy));
        }
        None
    }

    fn throttle_reason(&self, m: &PerformanceMetrics) -> Option<String> {
        if m.total_submissions >= MIN_SAMPLES
            && m.inclusion_rate >= self.limits.halt_inclusion_rate
            && m.inclusion_rate < self.limits.throttle_inclusion_rate
        {
            return Some(format!("inclusion rate = {}", m.inclusion_rate));
        }
        if m.total_executions >= MIN_SAMPLES
            && m.simulation_accuracy >= self.limits.halt_accuracy
            && m.simulation_accuracy < self.limits.throttle_accuracy
        {
            return Some(format!("simulation accuracy = {}", m.simulation_accuracy));
        }
        None
    }

    /// Recovery needs both metrics strictly above the throttle bounds.
    fn recovered(&self, m: &PerformanceMetrics) -> bool {
        m.total_submissions >= MIN_SAMPLES
            && m.total_executions >= MIN_SAMPLES
            && m.inclusion_rate > self.limits.throttle_inclusion_rate
            && m.simulation_accuracy > self.limits.throttle_accuracy
    }

    /// Snapshot of the submission window, oldest first. The bribe model
    /// reads this at 100-submission boundaries.
    pub fn submission_window(&self) -> Vec<SubmissionSample> {
        self.inner.lock().submission_history.iter().cloned().collect()
    }

    /// Total submissions observed in the current window.
    pub fn submissions_seen(&self) -> usize {
        self.inner.lock().submission_history.len()
    }

    /// Current daily volume in USD.
    pub fn daily_volume_usd(&self) -> Decimal {
        self.inner.lock().daily_volume_usd
    }

    /// Limits this controller enforces.
    pub fn limits(&self) -> &SafetyConfig {
        &self.limits
    }

    #[cfg(test)]
    fn seed_window(&self, included: usize, not_included: usize) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        for _ in 0..included {
            push_bounded(
                &mut inner.submission_history,
                SubmissionSample { timestamp: now, included: true },
            );
        }
        for _ in 0..not_included {
            push_bounded(
                &mut inner.submission_history,
                SubmissionSample { timestamp: now, included: false },
            );
        }
    }

    #[cfg(test)]
    fn seed_executions(&self, samples: &[(Decimal, Decimal)]) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        for (simulated, actual) in samples {
            push_bounded(
                &mut inner.execution_history,
                ExecutionSample {
                    timestamp: now,
                    simulated_profit_usd: *simulated,
                    actual_profit_usd: *actual,
                },
            );
        }
    }
}

fn push_bounded<T>(deque: &mut VecDeque<T>, sample: T) {
    if deque.len() == WINDOW_SIZE {
        deque.pop_front();
    }
    deque.push_back(sample);
}

fn reset_daily_if_needed(inner: &mut Inner, now: DateTime<Utc>) {
    if now >= inner.daily_reset_at {
        info!(previous_volume = %inner.daily_volume_usd, "daily volume reset");
        inner.daily_volume_usd = Decimal::ZERO;
        inner.daily_reset_at = next_midnight_utc(now);
    }
}

fn next_midnight_utc(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + ChronoDuration::days(1);
    tomorrow.and_hms_opt(0, 0, 0).expect("midnight exists").and_utc()
}

fn compute_metrics(inner: &Inner, now: DateTime<Utc>) -> PerformanceMetrics {
    let total_submissions = inner.submission_history.len();
    let successful_inclusions =
        inner.submission_history.iter().filter(|s| s.included).count();

    // Exact ratio over the deque, no rounding shortcuts.
    let inclusion_rate = if total_submissions > 0 {
        Decimal::from(successful_inclusions as u64) / Decimal::from(total_submissions as u64)
    } else {
        Decimal::ZERO
    };

    let total_executions = inner.execution_history.len();
    let mut accuracy_sum = Decimal::ZERO;
    let mut total_profit = Decimal::ZERO;
    for sample in &inner.execution_history {
        if sample.simulated_profit_usd > Decimal::ZERO {
            if let Some(ratio) =
                sample.actual_profit_usd.checked_div(sample.simulated_profit_usd)
            {
                accuracy_sum += ratio;
            }
        }
        total_profit += sample.actual_profit_usd;
    }
    let simulation_accuracy = if total_executions > 0 {
        (accuracy_sum / Decimal::from(total_executions as u64))
            .round_dp_with_strategy(8, RoundingStrategy::MidpointNearestEven)
    } else {
        Decimal::ZERO
    };
    let average_profit = if total_executions > 0 {
        (total_profit / Decimal::from(total_executions as u64))
            .round_dp_with_strategy(8, RoundingStrategy::MidpointNearestEven)
    } else {
        Decimal::ZERO
    };

    PerformanceMetrics {
        timestamp: now,
        window_size: WINDOW_SIZE,
        total_submissions,
        successful_inclusions,
        inclusion_rate,
        total_executions,
        simulation_accuracy,
        total_profit_usd: total_profit,
        average_profit_usd: average_profit,
        consecutive_failures: inner.consecutive_failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::NullAuditSink;
    use crate::types::{CostBreakdown, LiquidationTx, Opportunity, Position, SubmissionPath};
    use alloy::primitives::{Address, Bytes, B256, U256};
    use rust_decimal_macros::dec;

    fn limits() -> SafetyConfig {
        SafetyConfig { throttle_seed: Some(42), ..SafetyConfig::default() }
    }

    fn controller() -> SafetyController {
        SafetyController::new(limits(), Arc::new(NullAuditSink))
    }

    fn bundle(net: Decimal) -> Bundle {
        let position = Position::new(
            "seamless",
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            U256::from(1u64),
            Address::repeat_byte(3),
            U256::from(1u64),
            dec!(0.80),
            10,
        )
        .unwrap();
        let opportunity = Opportunity::new(
            position,
            dec!(0.9),
            dec!(2000),
            dec!(1),
            dec!(0.05),
            dec!(500),
            dec!(200),
            10,
            Utc::now(),
        )
        .unwrap();
        let simulated = net + dec!(10);
        let costs = CostBreakdown {
            simulated_profit_usd: simulated,
            l2_gas_cost_usd: dec!(10),
            l1_data_cost_usd: dec!(0),
            bribe_usd: dec!(0),
            flash_loan_cost_usd: dec!(0),
            slippage_cost_usd: dec!(0),
            total_cost_usd: dec!(10),
            net_profit_usd: net,
        };
        Bundle::new(
            opportunity,
            LiquidationTx {
                to: Address::repeat_byte(9),
                data: Bytes::from(vec![1, 2, 3]),
                value: U256::ZERO,
                gas_limit: 500_000,
                max_fee_per_gas: 4_000_000_000,
                max_priority_fee_per_gas: 2_000_000_000,
                nonce: 0,
                chain_id: 8453,
            },
            U256::from(1u64),
            350_000,
            costs,
            SubmissionPath::Mempool,
        )
        .unwrap()
    }

    fn included_record(simulated: Decimal, actual: Decimal) -> ExecutionRecord {
        let mut record = ExecutionRecord::outcome(
            &bundle(dec!(100)),
            SystemState::Normal,
            B256::repeat_byte(7),
            ExecutionStatus::Included,
            Some(11),
            Some(U256::from(1u64)),
            Some(actual),
        );
        record.simulated_profit_usd = Some(simulated);
        record
    }

    fn expired_record() -> ExecutionRecord {
        ExecutionRecord::outcome(
            &bundle(dec!(100)),
            SystemState::Normal,
            B256::repeat_byte(7),
            ExecutionStatus::Expired,
            None,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn throttled_gate_is_deterministic_with_seed() {
        let controller = controller();
        controller.transition(SystemState::Throttled, "test").await;

        let a: Vec<bool> = (0..32).map(|_| controller.can_execute()).collect();

        let again = SafetyController::new(limits(), Arc::new(NullAuditSink));
        again.transition(SystemState::Throttled, "test").await;
        let b: Vec<bool> = (0..32).map(|_| again.can_execute()).collect();

        assert_eq!(a, b);
        // Roughly half pass; with 32 draws anything from 8 to 24 is sane.
        let passes = a.iter().filter(|x| **x).count();
        assert!((8..=24).contains(&passes), "passes = {passes}");
    }

    #[tokio::test]
    async fn halted_never_executes_normal_always_does() {
        let controller = controller();
        assert!(controller.can_execute());
        controller.transition(SystemState::Halted, "test").await;
        for _ in 0..16 {
            assert!(!controller.can_execute());
        }
    }

    #[tokio::test]
    async fn validate_rejects_below_min_profit() {
        let controller = controller();
        let result = controller.validate_execution(&bundle(dec!(49.99))).await;
        assert!(matches!(result, Err(SafetyError::BelowMinProfit { .. })));
    }

    #[tokio::test]
    async fn validate_rejects_above_single_cap() {
        let controller = controller();
        let result = controller.validate_execution(&bundle(dec!(500.01))).await;
        assert!(matches!(result, Err(SafetyError::SingleExecutionCap { .. })));
    }

    #[tokio::test]
    async fn daily_cap_is_boundary_inclusive() {
        let controller = controller();

        // Fill daily volume to $2300 via included executions.
        for _ in 0..23 {
            controller.record_execution(&included_record(dec!(100), dec!(100))).await;
        }
        assert_eq!(controller.daily_volume_usd(), dec!(2300));

        // 2300 + 200 == 2500 exactly: accepted.
        controller.validate_execution(&bundle(dec!(200))).await.unwrap();

        // One more dollar of volume and the same candidate is rejected.
        controller.record_execution(&included_record(dec!(1), dec!(1))).await;
        let result = controller.validate_execution(&bundle(dec!(200))).await;
        assert!(matches!(result, Err(SafetyError::DailyVolumeCap { .. })));
    }

    #[tokio::test]
    async fn counters_follow_outcome_classes() {
        let controller = controller();

        controller.record_execution(&expired_record()).await;
        controller.record_execution(&expired_record()).await;
        let m = controller.calculate_metrics(true).await;
        assert_eq!(m.consecutive_failures, 2);
        assert_eq!(m.total_submissions, 2);
        assert_eq!(m.total_executions, 0);

        // An inclusion resets the streak and enters both windows.
        controller.record_execution(&included_record(dec!(100), dec!(95))).await;
        let m = controller.calculate_metrics(true).await;
        assert_eq!(m.consecutive_failures, 0);
        assert_eq!(m.total_submissions, 3);
        assert_eq!(m.total_executions, 1);

        // A pre-submission rejection is a row only.
        let rejection = ExecutionRecord::rejection(
            bundle(dec!(100)).opportunity(),
            SystemState::Normal,
            false,
            "revert: unprofitable",
        );
        controller.record_execution(&rejection).await;
        let m = controller.calculate_metrics(true).await;
        assert_eq!(m.consecutive_failures, 0);
        assert_eq!(m.total_submissions, 3);
    }

    #[tokio::test]
    async fn inclusion_rate_is_exact_over_window() {
        let controller = controller();
        controller.seed_window(40, 60);
        let m = controller.calculate_metrics(true).await;
        assert_eq!(m.inclusion_rate, dec!(0.4));
        assert_eq!(m.total_submissions, 100);
        assert_eq!(m.successful_inclusions, 40);
    }

    #[tokio::test]
    async fn inclusion_rate_exactly_point_six_stays_normal() {
        let controller = controller();
        controller.seed_window(60, 40);
        controller.seed_executions(&[(dec!(100), dec!(100)); 10]);
        controller.check_and_apply_transitions().await;
        assert_eq!(controller.current_state(), SystemState::Normal);
    }

    #[tokio::test]
    async fn throttle_band_and_halt_band() {
        // 55% inclusion: inside [halt, throttle) -> THROTTLED.
        let controller = controller();
        controller.seed_window(55, 45);
        controller.seed_executions(&[(dec!(100), dec!(100)); 10]);
        controller.check_and_apply_transitions().await;
        assert_eq!(controller.current_state(), SystemState::Throttled);

        // 45% inclusion: below halt threshold -> HALTED.
        let controller = SafetyController::new(limits(), Arc::new(NullAuditSink));
        controller.seed_window(45, 55);
        controller.check_and_apply_transitions().await;
        assert_eq!(controller.current_state(), SystemState::Halted);
    }

    #[tokio::test]
    async fn accuracy_band_drives_transitions() {
        // Accuracy 0.87 with healthy inclusion -> THROTTLED.
        let controller = controller();
        controller.seed_window(95, 5);
        controller.seed_executions(&[(dec!(100), dec!(87)); 10]);
        controller.check_and_apply_transitions().await;
        assert_eq!(controller.current_state(), SystemState::Throttled);

        // Accuracy 0.80 -> HALTED.
        let controller = SafetyController::new(limits(), Arc::new(NullAuditSink));
        controller.seed_window(95, 5);
        controller.seed_executions(&[(dec!(100), dec!(80)); 10]);
        controller.check_and_apply_transitions().await;
        assert_eq!(controller.current_state(), SystemState::Halted);
    }

    #[tokio::test]
    async fn recovery_requires_both_metrics_strictly_above() {
        let controller = controller();
        controller.transition(SystemState::Throttled, "test").await;

        // Inclusion recovered, accuracy exactly at the bound: stay
        // THROTTLED (strict inequality required).
        controller.seed_window(80, 20);
        controller.seed_executions(&[(dec!(100), dec!(90)); 10]);
        controller.check_and_apply_transitions().await;
        assert_eq!(controller.current_state(), SystemState::Throttled);

        // Both strictly above: recover.
        let controller = SafetyController::new(limits(), Arc::new(NullAuditSink));
        controller.transition(SystemState::Throttled, "test").await;
        controller.seed_window(80, 20);
        controller.seed_executions(&[(dec!(100), dec!(95)); 10]);
        controller.check_and_apply_transitions().await;
        assert_eq!(controller.current_state(), SystemState::Normal);
    }

    #[tokio::test]
    async fn halted_exits_only_via_manual_resume() {
        let controller = controller();
        controller.transition(SystemState::Halted, "divergence").await;

        // Perfect metrics do not recover a halted system.
        controller.seed_window(100, 0);
        controller.seed_executions(&[(dec!(100), dec!(100)); 10]);
        controller.check_and_apply_transitions().await;
        assert_eq!(controller.current_state(), SystemState::Halted);

        // Resume from the operator does.
        assert!(controller.manual_resume("ops-1", "root cause fixed").await);
        assert_eq!(controller.current_state(), SystemState::Normal);

        // And it is a no-op when not halted.
        assert!(!controller.manual_resume("ops-1", "noise").await);
    }

    #[tokio::test]
    async fn consecutive_failures_trigger_halt() {
        let controller = controller();
        for _ in 0..3 {
            controller.record_execution(&expired_record()).await;
        }
        controller.check_and_apply_transitions().await;
        assert_eq!(controller.current_state(), SystemState::Halted);
    }

    #[tokio::test]
    async fn metrics_cache_honors_ttl_and_force() {
        let controller = controller();
        let first = controller.calculate_metrics(false).await;
        controller.seed_window(10, 0);

        // Cached copy still served inside the TTL.
        let cached = controller.calculate_metrics(false).await;
        assert_eq!(cached.total_submissions, first.total_submissions);

        // Forced recompute sees the new window.
        let forced = controller.calculate_metrics(true).await;
        assert_eq!(forced.total_submissions, 10);
    }
}
