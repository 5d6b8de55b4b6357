//! Expected-value submission path selection.

use rust_decimal::Decimal;
use tracing::debug;

use crate::types::SubmissionPath;

/// Assumed inclusion rate for a path with no history.
fn default_inclusion_rate() -> Decimal {
    Decimal::new(70, 2)
}

/// Lifetime statistics for one submission path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathSnapshot {
    pub path: SubmissionPath,
    pub submission_count: u64,
    pub success_count: u64,
}

impl PathSnapshot {
    pub fn inclusion_rate(&self) -> Decimal {
        if self.submission_count == 0 {
            return default_inclusion_rate();
        }
        Decimal::from(self.success_count) / Decimal::from(self.submission_count)
    }
}

/// Pick the path with the highest expected value:
/// `EV = profit * inclusion_rate - (bribe if builder)`.
///
/// Ties resolve in the fixed order mempool > builder > private_rpc; a
/// strictly greater EV is required to displace an earlier path.
pub fn select_path(
    snapshots: &[PathSnapshot],
    simulated_profit_usd: Decimal,
    bribe_usd: Decimal,
) -> SubmissionPath {
    let mut best_path = SubmissionPath::Mempool;
    let mut best_ev: Option<Decimal> = None;

    for path in SubmissionPath::ALL {
        let snapshot = snapshots
            .iter()
            .find(|s| s.path == path)
            .copied()
            .unwrap_or(PathSnapshot { path, submission_count: 0, success_count: 0 });

        let path_bribe =
            if path == SubmissionPath::Builder { bribe_usd } else { Decimal::ZERO };
        let ev = simulated_profit_usd * snapshot.inclusion_rate() - path_bribe;

        debug!(
            path = %path,
            ev = %ev,
            inclusion_rate = %snapshot.inclusion_rate(),
            "path expected value"
        );

        if best_ev.map_or(true, |current| ev > current) {
            best_ev = Some(ev);
            best_path = path;
        }
    }

    best_path
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(path: SubmissionPath, submissions: u64, successes: u64) -> PathSnapshot {
        PathSnapshot { path, submission_count: submissions, success_count: successes }
    }

    #[test]
    fn fresh_paths_tie_break_to_mempool() {
        // No history anywhere: every path assumes 0.70 inclusion; builder
        // pays the bribe, so mempool and private tie and mempool wins.
        let path = select_path(&[], dec!(100), dec!(15));
        assert_eq!(path, SubmissionPath::Mempool);
    }

    #[test]
    fn strong_builder_history_beats_mempool() {
        let snapshots = [
            snapshot(SubmissionPath::Mempool, 100, 40),
            snapshot(SubmissionPath::Builder, 100, 95),
            snapshot(SubmissionPath::PrivateRpc, 100, 50),
        ];
        // mempool EV = 40, builder EV = 95 - 15 = 80, private EV = 50.
        let path = select_path(&snapshots, dec!(100), dec!(15));
        assert_eq!(path, SubmissionPath::Builder);
    }

    #[test]
    fn bribe_discount_only_applies_to_builder() {
        let snapshots = [
            snapshot(SubmissionPath::Mempool, 100, 80),
            snapshot(SubmissionPath::Builder, 100, 90),
            snapshot(SubmissionPath::PrivateRpc, 100, 85),
        ];
        // builder EV = 90 - 15 = 75 loses to private EV = 85.
        let path = select_path(&snapshots, dec!(100), dec!(15));
        assert_eq!(path, SubmissionPath::PrivateRpc);
    }

    #[test]
    fn exact_tie_resolves_in_declared_order() {
        let snapshots = [
            snapshot(SubmissionPath::Mempool, 100, 70),
            snapshot(SubmissionPath::Builder, 100, 70),
            snapshot(SubmissionPath::PrivateRpc, 100, 70),
        ];
        // Zero bribe: all EVs equal, mempool declared first.
        let path = select_path(&snapshots, dec!(100), dec!(0));
        assert_eq!(path, SubmissionPath::Mempool);
    }

    #[test]
    fn unknown_history_assumes_seventy_percent() {
        let fresh = snapshot(SubmissionPath::Builder, 0, 0);
        assert_eq!(fresh.inclusion_rate(), dec!(0.70));
    }
}
