//! Sequencer guard: anomaly rules over consecutive block headers.
//!
//! Gaps, reorgs and timestamp jumps beyond their tolerances halt the
//! system; small irregularities proceed with a warning. Block-production
//! stalls are watched separately by the 5 s monitor task.

/// Gap (in blocks) above which the guard halts.
const MAX_BLOCK_GAP: u64 = 3;

/// Reorg depth above which the guard halts.
const MAX_REORG_DEPTH: u64 = 3;

/// Timestamp jump (seconds) above which the guard halts.
const MAX_TIMESTAMP_JUMP: u64 = 20;

/// Seconds without a new block before the watchdog halts.
pub const STALL_TIMEOUT_SECS: u64 = 10;

/// Outcome of assessing one header against the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Proceed,
    /// Tolerable anomaly; processing continues, the reason is logged.
    Warn(String),
    /// Anomalous block production; the system must halt.
    Halt(String),
}

impl GuardVerdict {
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Halt(_))
    }
}

/// Assess a new `(block, timestamp)` pair against the previous one.
/// A zero `prev_block` means no history yet and always proceeds.
pub fn assess(prev_block: u64, prev_timestamp: u64, block: u64, timestamp: u64) -> GuardVerdict {
    let mut warning: Option<String> = None;

    if prev_block > 0 {
        if block > prev_block {
            let gap = block - prev_block;
            if gap > MAX_BLOCK_GAP {
                return GuardVerdict::Halt(format!(
                    "block gap of {gap} blocks ({prev_block} -> {block})"
                ));
            }
            if gap > 1 {
                warning = Some(format!("block gap of {gap} blocks ({prev_block} -> {block})"));
            }
        } else {
            // block <= prev_block is a reorg of depth prev - block + 1.
            let depth = prev_block - block + 1;
            if depth > MAX_REORG_DEPTH {
                return GuardVerdict::Halt(format!("reorg of depth {depth} at block {block}"));
            }
            warning = Some(format!("reorg of depth {depth} at block {block}"));
        }
    }

    if prev_timestamp > 0 {
        if timestamp < prev_timestamp {
            return GuardVerdict::Halt(format!(
                "timestamp went backwards by {} s",
                prev_timestamp - timestamp
            ));
        }
        let jump = timestamp - prev_timestamp;
        if jump > MAX_TIMESTAMP_JUMP {
            return GuardVerdict::Halt(format!("timestamp jump of {jump} s"));
        }
    }

    match warning {
        Some(reason) => GuardVerdict::Warn(reason),
        None => GuardVerdict::Proceed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_block_proceeds() {
        assert_eq!(assess(100, 1000, 101, 1002), GuardVerdict::Proceed);
    }

    #[test]
    fn first_block_has_no_history() {
        assert_eq!(assess(0, 0, 5_000_000, 1000), GuardVerdict::Proceed);
    }

    #[test]
    fn small_gap_warns_large_gap_halts() {
        assert!(matches!(assess(100, 1000, 102, 1004), GuardVerdict::Warn(_)));
        assert!(matches!(assess(100, 1000, 103, 1006), GuardVerdict::Warn(_)));
        assert!(assess(100, 1000, 104, 1008).is_halt());
    }

    #[test]
    fn shallow_reorg_warns_deep_reorg_halts() {
        // Depth = prev - block + 1: 100 -> 98 is depth 3.
        assert!(matches!(assess(100, 1000, 98, 1000), GuardVerdict::Warn(_)));
        // 100 -> 97 is depth 4.
        assert!(assess(100, 1000, 97, 1000).is_halt());
    }

    #[test]
    fn backwards_timestamp_halts() {
        assert!(assess(100, 1000, 101, 999).is_halt());
    }

    #[test]
    fn timestamp_jump_boundary() {
        // Exactly 20 s proceeds; 21 s halts.
        assert_eq!(assess(100, 1000, 101, 1020), GuardVerdict::Proceed);
        assert!(assess(100, 1000, 101, 1021).is_halt());
    }

    #[test]
    fn same_block_number_is_depth_one_reorg() {
        assert!(matches!(assess(100, 1000, 100, 1000), GuardVerdict::Warn(_)));
    }
}
