//! Transaction signing and submission-path routing.
//!
//! Three adapters share one interface: direct mempool, builder endpoint
//! (falls back to the mempool while no builder URL is configured) and the
//! private RPC (the backup endpoint). Each tracks lifetime submission and
//! success counts that feed expected-value path selection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use tracing::{info, warn};

use liquidator_core::error::RpcError;
use liquidator_core::planner::PathSnapshot;
use liquidator_core::types::{LiquidationTx, SubmissionPath};

use crate::provider::to_rpc_error;

/// Submission retry budget and backoff start (1 s, doubling).
const MAX_SUBMIT_ATTEMPTS: u32 = 3;
const SUBMIT_BACKOFF_BASE_SECS: u64 = 1;

#[derive(Debug, Default)]
struct PathStats {
    submission_count: AtomicU64,
    success_count: AtomicU64,
}

/// Signs bundles and routes raw transactions to the chosen path.
pub struct SubmissionRouter {
    wallet: EthereumWallet,
    operator: Address,
    mempool_url: String,
    builder_url: Option<String>,
    private_url: String,
    stats: HashMap<SubmissionPath, PathStats>,
}

impl SubmissionRouter {
    /// Build from the operator's signing key. The key string never leaves
    /// this constructor.
    pub fn new(
        private_key: &str,
        mempool_url: String,
        builder_url: Option<String>,
        private_url: String,
    ) -> Result<Self, RpcError> {
        let signer: PrivateKeySigner = private_key
            .trim_start_matches("0x")
            .parse()
            .map_err(|_| RpcError::Transport("invalid operator key".to_string()))?;
        let operator = signer.address();
        let wallet = EthereumWallet::from(signer);

        let stats = SubmissionPath::ALL
            .iter()
            .map(|path| (*path, PathStats::default()))
            .collect();

        Ok(Self { wallet, operator, mempool_url, builder_url, private_url, stats })
    }

    pub fn operator(&self) -> Address {
        self.operator
    }

    /// Lifetime statistics snapshot for path selection.
    pub fn snapshots(&self) -> Vec<PathSnapshot> {
        SubmissionPath::ALL
            .iter()
            .map(|path| {
                let stats = &self.stats[path];
                PathSnapshot {
                    path: *path,
                    submission_count: stats.submission_count.load(Ordering::Relaxed),
                    success_count: stats.success_count.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Count one submission on a path.
    pub fn record_submission(&self, path: SubmissionPath) {
        self.stats[&path].submission_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one observed inclusion on a path.
    pub fn record_success(&self, path: SubmissionPath) {
        self.stats[&path].success_count.fetch_add(1, Ordering::Relaxed);
    }

    fn endpoint(&self, path: SubmissionPath) -> &str {
        match path {
            SubmissionPath::Mempool => &self.mempool_url,
            SubmissionPath::Builder => match &self.builder_url {
                Some(url) => url,
                // No builder available yet; the bribe is simply not paid.
                None => &self.mempool_url,
            },
            SubmissionPath::PrivateRpc => &self.private_url,
        }
    }

    /// Sign as an EIP-1559 type-2 envelope and return the raw bytes.
    pub async fn sign(&self, tx: &LiquidationTx) -> Result<Vec<u8>, RpcError> {
        let request = TransactionRequest::default()
            .with_to(tx.to)
            .with_input(tx.data.clone())
            .with_value(tx.value)
            .with_nonce(tx.nonce)
            .with_gas_limit(tx.gas_limit)
            .with_max_fee_per_gas(tx.max_fee_per_gas)
            .with_max_priority_fee_per_gas(tx.max_priority_fee_per_gas)
            .with_chain_id(tx.chain_id);

        let envelope = request
            .build(&self.wallet)
            .await
            .map_err(|e| RpcError::Transport(format!("signing failed: {e}")))?;
        Ok(envelope.encoded_2718())
    }

    /// Submit raw bytes on one path, retrying transient transport
    /// failures with exponential backoff.
    pub async fn submit(&self, path: SubmissionPath, raw: &[u8]) -> Result<B256, RpcError> {
        let url = self.endpoint(path).to_string();
        let mut last_error = RpcError::Transport("no attempt made".to_string());

        for attempt in 0..MAX_SUBMIT_ATTEMPTS {
            if attempt > 0 {
                let backoff = SUBMIT_BACKOFF_BASE_SECS << (attempt - 1);
                warn!(path = %path, attempt, backoff_secs = backoff, "retrying submission");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }

            match self.send_raw(&url, raw).await {
                Ok(hash) => {
                    self.record_submission(path);
                    info!(path = %path, tx_hash = %hash, "transaction submitted");
                    return Ok(hash);
                }
                Err(e) => {
                    warn!(path = %path, attempt, error = %e, "submission attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn send_raw(&self, url: &str, raw: &[u8]) -> Result<B256, RpcError> {
        let parsed = url.parse().map_err(|_| RpcError::InvalidUrl(url.to_string()))?;
        let provider = ProviderBuilder::new().on_http(parsed);
        let pending = provider.send_raw_transaction(raw).await.map_err(to_rpc_error)?;
        Ok(*pending.tx_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known throwaway development key.
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn router() -> SubmissionRouter {
        SubmissionRouter::new(
            TEST_KEY,
            "http://mempool.invalid".to_string(),
            None,
            "http://private.invalid".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn operator_address_derives_from_key() {
        let router = router();
        assert_eq!(
            format!("{:#x}", router.operator()),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn builder_path_falls_back_to_mempool_when_unset() {
        let router = router();
        assert_eq!(router.endpoint(SubmissionPath::Builder), "http://mempool.invalid");
        assert_eq!(router.endpoint(SubmissionPath::PrivateRpc), "http://private.invalid");
    }

    #[test]
    fn stats_track_per_path() {
        let router = router();
        router.record_submission(SubmissionPath::Mempool);
        router.record_submission(SubmissionPath::Mempool);
        router.record_success(SubmissionPath::Mempool);

        let snapshots = router.snapshots();
        let mempool = snapshots.iter().find(|s| s.path == SubmissionPath::Mempool).unwrap();
        assert_eq!(mempool.submission_count, 2);
        assert_eq!(mempool.success_count, 1);

        let builder = snapshots.iter().find(|s| s.path == SubmissionPath::Builder).unwrap();
        assert_eq!(builder.submission_count, 0);
    }

    #[test]
    fn rejects_malformed_key() {
        let result = SubmissionRouter::new(
            "not-a-key",
            "http://m".to_string(),
            None,
            "http://p".to_string(),
        );
        assert!(result.is_err());
    }
}
