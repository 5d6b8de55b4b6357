//! Chain-facing side of the liquidation engine: RPC and WebSocket
//! connectors, event decoding, the sequencer guard, oracle gateway, gas
//! quoting, the executor contract client with its mandatory simulation,
//! the L1 fee oracle and submission-path routing.

pub mod events;
pub mod executor;
pub mod gas;
pub mod l1fee;
pub mod oracle;
pub mod planner;
pub mod protocol;
pub mod provider;
pub mod sequencer;
pub mod submit;
pub mod ws;

pub use events::{decode_log, ProtocolEvent};
pub use executor::{ExecutorClient, SimulationOutcome};
pub use gas::{fetch_quote, GasQuote};
pub use l1fee::L1FeeOracle;
pub use oracle::{sanity_evaluate, OracleGateway};
pub use planner::{ExecutionPlanner, PlanError};
pub use protocol::{CanonicalPosition, ProtocolRegistry};
pub use provider::ProviderManager;
pub use sequencer::{assess, GuardVerdict, STALL_TIMEOUT_SECS};
pub use submit::SubmissionRouter;
pub use ws::{BlockHead, WsListener};
