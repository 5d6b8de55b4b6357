//! Error taxonomy shared across the engine.
//!
//! Each kind maps to one propagation policy: RPC errors retry and fail over,
//! simulation and safety errors drop the candidate and continue, cache errors
//! switch to the in-process fallback, database errors queue in memory, state
//! errors halt the system, configuration errors abort startup.

use thiserror::Error;

/// Top-level error type for the liquidation engine.
#[derive(Debug, Error)]
pub enum LiquidatorError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Transport-level RPC failures. Retried locally with failover; never
/// rejects a liquidation decision on its own.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("server returned status {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("websocket closed: {0}")]
    WsClosed(String),

    #[error("all providers exhausted: {0}")]
    AllProvidersFailed(String),

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
}

/// A candidate failed on-chain validation. The opportunity is dropped and
/// logged; the scan continues.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("eth_call reverted: {0}")]
    Reverted(String),

    #[error("simulated profit is zero or negative")]
    NoProfit,

    #[error("gas estimation failed: {0}")]
    EstimateFailed(String),

    #[error("treasury lookup failed: {0}")]
    TreasuryUnavailable(String),

    #[error("simulation cancelled: new block arrived")]
    Cancelled,
}

/// Key-value store failures. The cache switches to its in-process layer and
/// schedules a rebuild once the backend recovers.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unreachable: {0}")]
    BackendUnavailable(String),

    #[error("failed to decode cached entry: {0}")]
    Corrupt(String),
}

/// Durable-store failures. Rows are queued in memory (FIFO, capacity 100)
/// and flushed when the store recovers.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database unreachable: {0}")]
    Unavailable(String),

    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Irrecoverable divergence between the mirror and the chain. Always halts.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state divergence of {divergence_bps} bps on {field} for {protocol}:{user}")]
    Divergence {
        protocol: String,
        user: String,
        field: &'static str,
        divergence_bps: u64,
    },

    #[error("sequencer anomaly: {0}")]
    SequencerAnomaly(String),

    #[error("block production stalled for {0} seconds")]
    BlockStall(u64),
}

/// A candidate violated an operator-configured limit. The candidate is
/// rejected; the engine keeps running.
#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("net profit ${net} below minimum ${min}")]
    BelowMinProfit { net: String, min: String },

    #[error("net profit ${net} exceeds single-execution cap ${cap}")]
    SingleExecutionCap { net: String, cap: String },

    #[error("projected daily volume ${projected} exceeds cap ${cap}")]
    DailyVolumeCap { projected: String, cap: String },

    #[error("{0} consecutive failures at maximum")]
    ConsecutiveFailures(u32),

    #[error("execution blocked: system is {0}")]
    ExecutionBlocked(String),
}

/// Boot-time configuration problems. The process exits with code 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("secret retrieval failed: {0}")]
    Secret(String),
}
