//! Dynamic builder-bribe ladder.
//!
//! The bribe is a single percentage of simulated profit, adjusted only at
//! 100-submission boundaries: raised when inclusion lags, lowered when it
//! is comfortably high, bounded by the configured baseline and cap.
//! Applying the rule twice to the same window is a no-op the second time.

use std::hash::{Hash, Hasher};

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::safety::SubmissionSample;

/// Window length the ladder requires before it will move.
const UPDATE_WINDOW: usize = 100;

/// Inclusion rate below which the bribe steps up.
fn raise_below() -> Decimal {
    Decimal::new(60, 2)
}

/// Inclusion rate above which the bribe steps down.
fn lower_above() -> Decimal {
    Decimal::new(90, 2)
}

#[derive(Debug, Clone)]
pub struct BribeController {
    percent: Decimal,
    baseline_percent: Decimal,
    increase_percent: Decimal,
    decrease_percent: Decimal,
    max_percent: Decimal,
    last_window_fingerprint: Option<u64>,
}

impl BribeController {
    pub fn new(
        baseline_percent: Decimal,
        increase_percent: Decimal,
        decrease_percent: Decimal,
        max_percent: Decimal,
    ) -> Self {
        Self {
            percent: baseline_percent,
            baseline_percent,
            increase_percent,
            decrease_percent,
            max_percent,
            last_window_fingerprint: None,
        }
    }

    /// Current bribe as a percentage of simulated profit.
    pub fn percent(&self) -> Decimal {
        self.percent
    }

    /// Apply the ladder rule to a full window of recent submissions.
    /// Windows shorter than 100 samples leave the bribe untouched; a
    /// window already applied is skipped, so the update is idempotent.
    pub fn update(&mut self, window: &[SubmissionSample]) {
        if window.len() < UPDATE_WINDOW {
            debug!(samples = window.len(), "bribe update skipped: window not full");
            return;
        }

        let fingerprint = fingerprint(window);
        if self.last_window_fingerprint == Some(fingerprint) {
            debug!("bribe update skipped: window already applied");
            return;
        }
        self.last_window_fingerprint = Some(fingerprint);

        let included = window.iter().filter(|s| s.included).count();
        let inclusion_rate =
            Decimal::from(included as u64) / Decimal::from(window.len() as u64);

        let old = self.percent;
        if inclusion_rate < raise_below() {
            self.percent = (self.percent + self.increase_percent).min(self.max_percent);
            info!(
                inclusion_rate = %inclusion_rate,
                old_percent = %old,
                new_percent = %self.percent,
                "inclusion below 60%, raising bribe"
            );
        } else if inclusion_rate > lower_above() {
            self.percent = (self.percent - self.decrease_percent).max(self.baseline_percent);
            info!(
                inclusion_rate = %inclusion_rate,
                old_percent = %old,
                new_percent = %self.percent,
                "inclusion above 90%, lowering bribe"
            );
        } else {
            debug!(inclusion_rate = %inclusion_rate, "inclusion in target band, bribe unchanged");
        }
    }
}

fn fingerprint(window: &[SubmissionSample]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for sample in window {
        sample.timestamp.timestamp_nanos_opt().unwrap_or_default().hash(&mut hasher);
        sample.included.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn window(included: usize, not_included: usize) -> Vec<SubmissionSample> {
        let start = Utc::now();
        let mut samples = Vec::new();
        for i in 0..included {
            samples.push(SubmissionSample {
                timestamp: start + Duration::milliseconds(i as i64),
                included: true,
            });
        }
        for i in 0..not_included {
            samples.push(SubmissionSample {
                timestamp: start + Duration::milliseconds((included + i) as i64),
                included: false,
            });
        }
        samples
    }

    fn controller() -> BribeController {
        BribeController::new(dec!(15), dec!(5), dec!(2), dec!(40))
    }

    #[test]
    fn low_inclusion_raises_then_high_inclusion_lowers() {
        let mut bribe = controller();

        // 40% inclusion: 15 -> 20.
        bribe.update(&window(40, 60));
        assert_eq!(bribe.percent(), dec!(20));

        // 95% inclusion: 20 -> 18.
        bribe.update(&window(95, 5));
        assert_eq!(bribe.percent(), dec!(18));
    }

    #[test]
    fn in_band_inclusion_leaves_bribe_unchanged() {
        let mut bribe = controller();
        bribe.update(&window(75, 25));
        assert_eq!(bribe.percent(), dec!(15));
    }

    #[test]
    fn repeated_application_of_same_window_is_idempotent() {
        let mut bribe = controller();
        let w = window(40, 60);

        bribe.update(&w);
        assert_eq!(bribe.percent(), dec!(20));

        // Same window again: no further movement.
        bribe.update(&w);
        bribe.update(&w);
        assert_eq!(bribe.percent(), dec!(20));
    }

    #[test]
    fn capped_at_max_and_floored_at_baseline() {
        let mut bribe = controller();

        // Successive distinct bad windows cap at 40.
        for _ in 0..10 {
            bribe.update(&window(10, 90));
        }
        assert_eq!(bribe.percent(), dec!(40));

        // Successive distinct good windows floor at the baseline.
        for _ in 0..20 {
            bribe.update(&window(100, 0));
        }
        assert_eq!(bribe.percent(), dec!(15));
    }

    #[test]
    fn short_window_is_ignored() {
        let mut bribe = controller();
        bribe.update(&window(0, 99));
        assert_eq!(bribe.percent(), dec!(15));
    }
}
