//! HTTP provider management with primary/backup failover and a dedicated
//! archive endpoint for historical queries.
//!
//! Providers are built per call from their URL; no connection state is
//! shared between calls, so a failed endpoint never poisons the next
//! attempt. Every outbound call carries a per-attempt timeout.

use std::future::Future;
use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Block, TransactionReceipt, TransactionRequest};
use tracing::{debug, warn};

use liquidator_core::config::RpcConfig;
use liquidator_core::error::RpcError;

/// Primary + backup HTTP pair plus one archive endpoint.
pub struct ProviderManager {
    primary_http: String,
    backup_http: String,
    archive_http: String,
    request_timeout: Duration,
}

impl ProviderManager {
    pub fn new(rpc: &RpcConfig) -> Result<Self, RpcError> {
        for url in [&rpc.primary_http, &rpc.backup_http, &rpc.archive_http] {
            url.parse::<alloy::transports::http::reqwest::Url>()
                .map_err(|_| RpcError::InvalidUrl(url.clone()))?;
        }
        Ok(Self {
            primary_http: rpc.primary_http.clone(),
            backup_http: rpc.backup_http.clone(),
            archive_http: rpc.archive_http.clone(),
            request_timeout: Duration::from_secs(rpc.request_timeout_secs),
        })
    }

    pub fn primary_url(&self) -> &str {
        &self.primary_http
    }

    pub fn backup_url(&self) -> &str {
        &self.backup_http
    }

    pub fn archive_url(&self) -> &str {
        &self.archive_http
    }

    /// Run an operation against the primary endpoint, failing over to the
    /// backup on any transport error or timeout.
    async fn with_failover<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, RpcError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let timeout_ms = self.request_timeout.as_millis() as u64;

        match tokio::time::timeout(self.request_timeout, f(self.primary_http.clone())).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                warn!(op, error = %e, "primary endpoint failed, trying backup");
            }
            Err(_) => {
                warn!(op, timeout_ms, "primary endpoint timed out, trying backup");
            }
        }

        match tokio::time::timeout(self.request_timeout, f(self.backup_http.clone())).await {
            Ok(Ok(value)) => {
                debug!(op, "backup endpoint served request");
                Ok(value)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::Timeout(timeout_ms)),
        }
    }

    /// Run a historical query against the archive endpoint only.
    async fn with_archive<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, RpcError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let timeout_ms = self.request_timeout.as_millis() as u64;
        match tokio::time::timeout(self.request_timeout, f(self.archive_http.clone())).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout_ms, "archive endpoint timed out");
                Err(RpcError::Timeout(timeout_ms))
            }
        }
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.with_failover("eth_blockNumber", |url| async move {
            let provider = build_http(&url)?;
            provider.get_block_number().await.map_err(to_rpc_error)
        })
        .await
    }

    pub async fn chain_id(&self) -> Result<u64, RpcError> {
        self.with_failover("eth_chainId", |url| async move {
            let provider = build_http(&url)?;
            provider.get_chain_id().await.map_err(to_rpc_error)
        })
        .await
    }

    /// Fetch a block with full transaction bodies.
    pub async fn block_with_transactions(&self, number: u64) -> Result<Option<Block>, RpcError> {
        self.with_failover("eth_getBlockByNumber", |url| async move {
            let provider = build_http(&url)?;
            provider
                .get_block_by_number(BlockNumberOrTag::Number(number))
                .full()
                .await
                .map_err(to_rpc_error)
        })
        .await
    }

    /// Fetch every receipt of a block in one call.
    pub async fn block_receipts(
        &self,
        number: u64,
    ) -> Result<Option<Vec<TransactionReceipt>>, RpcError> {
        self.with_failover("eth_getBlockReceipts", |url| async move {
            let provider = build_http(&url)?;
            provider
                .get_block_receipts(BlockNumberOrTag::Number(number).into())
                .await
                .map_err(to_rpc_error)
        })
        .await
    }

    /// Base fee of the latest block, in wei.
    pub async fn latest_base_fee(&self) -> Result<u128, RpcError> {
        self.with_failover("eth_getBlockByNumber(latest)", |url| async move {
            let provider = build_http(&url)?;
            let block = provider
                .get_block_by_number(BlockNumberOrTag::Latest)
                .await
                .map_err(to_rpc_error)?
                .ok_or_else(|| RpcError::Transport("missing latest block".to_string()))?;
            Ok(block.header.base_fee_per_gas.map(|b| b as u128).unwrap_or(0))
        })
        .await
    }

    pub async fn transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        self.with_failover("eth_getTransactionCount", |url| async move {
            let provider = build_http(&url)?;
            provider.get_transaction_count(address).await.map_err(to_rpc_error)
        })
        .await
    }

    pub async fn balance(&self, address: Address) -> Result<U256, RpcError> {
        self.with_failover("eth_getBalance", |url| async move {
            let provider = build_http(&url)?;
            provider.get_balance(address).await.map_err(to_rpc_error)
        })
        .await
    }

    pub async fn code_at(&self, address: Address) -> Result<Bytes, RpcError> {
        self.with_failover("eth_getCode", |url| async move {
            let provider = build_http(&url)?;
            provider.get_code_at(address).await.map_err(to_rpc_error)
        })
        .await
    }

    /// `eth_call` at the latest block. Revert payloads come back in the
    /// error string.
    pub async fn call(&self, tx: &TransactionRequest) -> Result<Bytes, RpcError> {
        self.with_failover("eth_call", |url| {
            let tx = tx.clone();
            async move {
                let provider = build_http(&url)?;
                provider.call(tx).await.map_err(to_rpc_error)
            }
        })
        .await
    }

    /// Historical `eth_call` against the archive endpoint. Used only by
    /// reconciliation.
    pub async fn call_at(&self, tx: &TransactionRequest, block: u64) -> Result<Bytes, RpcError> {
        self.with_archive("eth_call(archive)", |url| {
            let tx = tx.clone();
            async move {
                let provider = build_http(&url)?;
                provider
                    .call(tx)
                    .block(BlockNumberOrTag::Number(block).into())
                    .await
                    .map_err(to_rpc_error)
            }
        })
        .await
    }

    pub async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, RpcError> {
        self.with_failover("eth_estimateGas", |url| {
            let tx = tx.clone();
            async move {
                let provider = build_http(&url)?;
                provider.estimate_gas(tx).await.map_err(to_rpc_error)
            }
        })
        .await
    }

    pub async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        self.with_failover("eth_getTransactionReceipt", |url| async move {
            let provider = build_http(&url)?;
            provider.get_transaction_receipt(hash).await.map_err(to_rpc_error)
        })
        .await
    }

    /// Liveness probe used by the orchestrator's preflight.
    pub async fn health_check(&self) -> Result<bool, RpcError> {
        let block = self.block_number().await?;
        debug!(block, "provider health check passed");
        Ok(block > 0)
    }
}

/// Build a one-shot HTTP provider for a URL.
pub(crate) fn build_http(url: &str) -> Result<impl Provider + Clone, RpcError> {
    let parsed = url.parse().map_err(|_| RpcError::InvalidUrl(url.to_string()))?;
    Ok(ProviderBuilder::new().on_http(parsed))
}

pub(crate) fn to_rpc_error(e: alloy::transports::TransportError) -> RpcError {
    RpcError::Transport(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc_config(primary: &str) -> RpcConfig {
        RpcConfig {
            primary_http: primary.to_string(),
            backup_http: "http://backup.invalid".to_string(),
            primary_ws: "ws://primary.invalid".to_string(),
            backup_ws: "ws://backup.invalid".to_string(),
            archive_http: "http://archive.invalid".to_string(),
            request_timeout_secs: 5,
        }
    }

    #[test]
    fn rejects_malformed_urls() {
        let result = ProviderManager::new(&rpc_config("not a url"));
        assert!(matches!(result, Err(RpcError::InvalidUrl(_))));
    }

    #[test]
    fn accepts_well_formed_urls() {
        let manager = ProviderManager::new(&rpc_config("http://primary.invalid")).unwrap();
        assert_eq!(manager.primary_url(), "http://primary.invalid");
        assert_eq!(manager.archive_url(), "http://archive.invalid");
    }
}
