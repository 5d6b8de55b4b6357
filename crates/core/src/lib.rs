//! Core domain logic for the rollup liquidation engine.
//!
//! This crate holds everything that can be reasoned about without touching
//! a network: the typed domain model, configuration, the opportunity
//! detector, the safety controller, and the pure planning math (cost
//! model, bribe ladder, path selection). The chain and store crates plug
//! into the seams defined in [`traits`].

pub mod config;
pub mod detector;
pub mod error;
pub mod math;
pub mod planner;
pub mod safety;
pub mod traits;
pub mod types;

pub use config::{
    AssetConfig, BotConfig, DexConfig, ExecutionConfig, MonitoringConfig, OracleConfig,
    ProtocolConfig, RedisConfig, RpcConfig, SafetyConfig,
};
pub use detector::OpportunityDetector;
pub use error::{
    CacheError, ConfigError, DatabaseError, LiquidatorError, RpcError, SafetyError,
    SimulationError, StateError,
};
pub use planner::{BribeController, CostInputs, PathSnapshot, calculate_costs, select_path};
pub use safety::{SafetyController, SubmissionSample};
pub use traits::{AuditSink, NullAuditSink, PositionStore, PriceOracle, ProtocolGuard};
pub use types::{
    Bundle, CostBreakdown, ExecutionRecord, ExecutionStatus, LiquidationTx, Opportunity,
    PerformanceMetrics, Position, StateDivergence, SubmissionPath, SystemEvent, SystemState,
};
