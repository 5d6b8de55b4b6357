//! Hierarchical configuration: environment variables override file values,
//! file values override defaults.
//!
//! The file is YAML (default path `config.yaml`, overridable with
//! `--config`). Secrets never live here; the operator key is retrieved from
//! the environment at boot and threaded to the signer only.

use std::collections::HashMap;
use std::path::Path;

use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// RPC endpoints. Primary and backup of each transport plus one archive
/// endpoint that can answer historical `eth_call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub primary_http: String,
    pub backup_http: String,
    pub primary_ws: String,
    pub backup_ws: String,
    pub archive_http: String,
    /// Per-attempt timeout for outbound calls (seconds)
    #[serde(default = "default_rpc_timeout")]
    pub request_timeout_secs: u64,
}

fn default_rpc_timeout() -> u64 {
    10
}

/// Key-value cache backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_cache_ttl() -> u64 {
    60
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: default_redis_url(), ttl_seconds: default_cache_ttl() }
    }
}

/// Durable store for audit rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_db_pool")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "postgres://liquidator@localhost:5432/liquidator".to_string()
}
fn default_db_pool() -> u32 {
    20
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: default_database_url(), max_connections: default_db_pool() }
    }
}

/// One lending market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub address: Address,
    /// Fraction in (0, 1]
    pub liquidation_threshold: Decimal,
    /// Fraction of seized collateral kept by the liquidator
    pub liquidation_bonus: Decimal,
    /// True for Aave-style pools, false for Compound-style
    #[serde(default)]
    pub aave_style: bool,
}

/// One asset the engine prices and trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    pub symbol: String,
    pub decimals: u8,
    /// Primary (Chainlink-style) feed
    pub chainlink_feed: Address,
    /// Optional secondary feed for divergence checks
    #[serde(default)]
    pub secondary_feed: Option<Address>,
}

/// Oracle sanity thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_max_divergence")]
    pub max_divergence_percent: Decimal,
    #[serde(default = "default_max_movement")]
    pub max_movement_percent: Decimal,
    /// ETH/USD feed used by the cost model
    pub eth_usd_feed: Address,
    /// Fallback when the feed is unreachable
    #[serde(default = "default_eth_usd_fallback")]
    pub eth_usd_fallback: Decimal,
}

fn default_max_divergence() -> Decimal {
    Decimal::from(5)
}
fn default_max_movement() -> Decimal {
    Decimal::from(30)
}
fn default_eth_usd_fallback() -> Decimal {
    Decimal::from(2000)
}

/// Swap-leg assumptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexConfig {
    #[serde(default = "default_max_slippage")]
    pub max_slippage_percent: Decimal,
}

fn default_max_slippage() -> Decimal {
    Decimal::ONE
}

impl Default for DexConfig {
    fn default() -> Self {
        Self { max_slippage_percent: default_max_slippage() }
    }
}

/// Operator-controlled risk limits and state-machine thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_min_profit")]
    pub min_profit_usd: Decimal,
    #[serde(default = "default_max_single")]
    pub max_single_execution_usd: Decimal,
    #[serde(default = "default_max_daily")]
    pub max_daily_volume_usd: Decimal,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_throttle_inclusion")]
    pub throttle_inclusion_rate: Decimal,
    #[serde(default = "default_throttle_accuracy")]
    pub throttle_accuracy: Decimal,
    #[serde(default = "default_halt_inclusion")]
    pub halt_inclusion_rate: Decimal,
    #[serde(default = "default_halt_accuracy")]
    pub halt_accuracy: Decimal,
    /// Seed for the THROTTLED coin-flip; fixed seeds make tests
    /// deterministic
    #[serde(default)]
    pub throttle_seed: Option<u64>,
}

fn default_min_profit() -> Decimal {
    Decimal::from(50)
}
fn default_max_single() -> Decimal {
    Decimal::from(500)
}
fn default_max_daily() -> Decimal {
    Decimal::from(2500)
}
fn default_max_failures() -> u32 {
    3
}
fn default_throttle_inclusion() -> Decimal {
    Decimal::new(60, 2)
}
fn default_throttle_accuracy() -> Decimal {
    Decimal::new(90, 2)
}
fn default_halt_inclusion() -> Decimal {
    Decimal::new(50, 2)
}
fn default_halt_accuracy() -> Decimal {
    Decimal::new(85, 2)
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_profit_usd: default_min_profit(),
            max_single_execution_usd: default_max_single(),
            max_daily_volume_usd: default_max_daily(),
            max_consecutive_failures: default_max_failures(),
            throttle_inclusion_rate: default_throttle_inclusion(),
            throttle_accuracy: default_throttle_accuracy(),
            halt_inclusion_rate: default_halt_inclusion(),
            halt_accuracy: default_halt_accuracy(),
            throttle_seed: None,
        }
    }
}

/// Execution-side parameters: contract addresses, gas, bribes, flash loans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub executor_contract: Address,
    #[serde(default = "default_l1_gas_oracle")]
    pub l1_gas_oracle: Address,
    /// Optional dedicated builder endpoint; the builder path falls back to
    /// the mempool when unset
    #[serde(default)]
    pub builder_url: Option<String>,
    #[serde(default = "default_baseline_bribe")]
    pub baseline_bribe_percent: Decimal,
    #[serde(default = "default_bribe_increase")]
    pub bribe_increase_percent: Decimal,
    #[serde(default = "default_bribe_decrease")]
    pub bribe_decrease_percent: Decimal,
    #[serde(default = "default_max_bribe")]
    pub max_bribe_percent: Decimal,
    #[serde(default = "default_flash_premium")]
    pub flash_loan_premium_percent: Decimal,
    #[serde(default = "default_priority_fee_gwei")]
    pub priority_fee_gwei: u64,
    #[serde(default = "default_fallback_gas_limit")]
    pub fallback_gas_limit: u64,
    /// Blocks to wait for a receipt before a submission counts as expired
    #[serde(default = "default_inclusion_window")]
    pub inclusion_window_blocks: u64,
}

fn default_l1_gas_oracle() -> Address {
    // OP-stack predeploy for the L1 fee oracle
    "0x420000000000000000000000000000000000000F".parse().unwrap()
}
fn default_baseline_bribe() -> Decimal {
    Decimal::from(15)
}
fn default_bribe_increase() -> Decimal {
    Decimal::from(5)
}
fn default_bribe_decrease() -> Decimal {
    Decimal::from(2)
}
fn default_max_bribe() -> Decimal {
    Decimal::from(40)
}
fn default_flash_premium() -> Decimal {
    Decimal::new(9, 2)
}
fn default_priority_fee_gwei() -> u64 {
    2
}
fn default_fallback_gas_limit() -> u64 {
    500_000
}
fn default_inclusion_window() -> u64 {
    5
}

/// Monitoring exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_metrics_interval")]
    pub metrics_export_interval_seconds: u64,
}

fn default_metrics_port() -> u16 {
    8000
}
fn default_metrics_interval() -> u64 {
    60
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            metrics_export_interval_seconds: default_metrics_interval(),
        }
    }
}

/// Root configuration object, immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_network")]
    pub network: String,
    pub rpc: RpcConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub protocols: HashMap<String, ProtocolConfig>,
    pub assets: HashMap<Address, AssetConfig>,
    pub oracles: OracleConfig,
    #[serde(default)]
    pub dex: DexConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u32,
    #[serde(default = "default_reconciliation_interval")]
    pub reconciliation_interval_blocks: u64,
}

fn default_chain_id() -> u64 {
    8453
}
fn default_network() -> String {
    "base".to_string()
}
fn default_scan_interval() -> u64 {
    5
}
fn default_confirmation_blocks() -> u32 {
    2
}
fn default_reconciliation_interval() -> u64 {
    10
}

impl BotConfig {
    /// Load from a YAML file, then apply environment overrides and
    /// validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
        let mut config: Self =
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables take precedence over file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RPC_PRIMARY_HTTP") {
            self.rpc.primary_http = v;
        }
        if let Ok(v) = std::env::var("RPC_BACKUP_HTTP") {
            self.rpc.backup_http = v;
        }
        if let Ok(v) = std::env::var("RPC_PRIMARY_WS") {
            self.rpc.primary_ws = v;
        }
        if let Ok(v) = std::env::var("RPC_BACKUP_WS") {
            self.rpc.backup_ws = v;
        }
        if let Ok(v) = std::env::var("RPC_ARCHIVE_HTTP") {
            self.rpc.archive_http = v;
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.redis.url = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("EXECUTOR_CONTRACT") {
            if let Ok(address) = v.parse() {
                self.execution.executor_contract = address;
            }
        }
        if let Ok(v) = std::env::var("MIN_PROFIT_USD") {
            if let Ok(d) = v.parse() {
                self.safety.min_profit_usd = d;
            }
        }
        if let Ok(v) = std::env::var("MAX_DAILY_VOLUME_USD") {
            if let Ok(d) = v.parse() {
                self.safety.max_daily_volume_usd = d;
            }
        }
        if let Ok(v) = std::env::var("SCAN_INTERVAL_SECONDS") {
            if let Ok(n) = v.parse() {
                self.scan_interval_seconds = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.protocols.is_empty() {
            return Err(ConfigError::Missing("protocols"));
        }
        if self.assets.is_empty() {
            return Err(ConfigError::Missing("assets"));
        }
        for (name, protocol) in &self.protocols {
            if protocol.liquidation_threshold <= Decimal::ZERO
                || protocol.liquidation_threshold > Decimal::ONE
            {
                return Err(ConfigError::InvalidValue {
                    field: "protocols.liquidation_threshold",
                    reason: format!(
                        "{name}: {} must be in (0, 1]",
                        protocol.liquidation_threshold
                    ),
                });
            }
        }
        if self.confirmation_blocks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "confirmation_blocks",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.safety.halt_inclusion_rate > self.safety.throttle_inclusion_rate {
            return Err(ConfigError::InvalidValue {
                field: "safety.halt_inclusion_rate",
                reason: "halt threshold must not exceed throttle threshold".to_string(),
            });
        }
        if self.execution.baseline_bribe_percent > self.execution.max_bribe_percent {
            return Err(ConfigError::InvalidValue {
                field: "execution.baseline_bribe_percent",
                reason: "baseline must not exceed max".to_string(),
            });
        }
        Ok(())
    }

    /// Look up the asset registry entry for a token address.
    pub fn asset(&self, address: Address) -> Option<&AssetConfig> {
        self.assets.get(&address)
    }

    /// Token decimals for an address; `None` means the asset is unknown and
    /// the caller cannot evaluate the position.
    pub fn asset_decimals(&self, address: Address) -> Option<u8> {
        self.asset(address).map(|a| a.decimals)
    }

    /// Resolve a protocol name from its pool contract address.
    pub fn protocol_by_address(&self, address: Address) -> Option<&str> {
        self.protocols
            .iter()
            .find(|(_, p)| p.address == address)
            .map(|(name, _)| name.as_str())
    }
}
