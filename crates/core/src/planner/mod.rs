//! Pure planning logic: the full L2+L1 cost model, the dynamic bribe
//! ladder and submission-path selection.
//!
//! Everything here is deterministic given its inputs; the chain-facing
//! side (simulation, gas, signing, submission) lives in the chain crate
//! and feeds these functions.

mod bribe;
mod cost;
mod path;

pub use bribe::BribeController;
pub use cost::{CostError, CostInputs, calculate_costs};
pub use path::{PathSnapshot, select_path};
