//! L1 data-posting fee via the rollup's gas price oracle predeploy.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes};
use alloy::sol;
use tracing::warn;

use crate::provider::{build_http, ProviderManager};

sol! {
    #[sol(rpc)]
    interface IL1GasOracle {
        function getL1Fee(bytes memory _data) external view returns (uint256);
    }
}

/// Client for `getL1Fee(calldata)`.
pub struct L1FeeOracle {
    provider: Arc<ProviderManager>,
    address: Address,
}

impl L1FeeOracle {
    pub fn new(provider: Arc<ProviderManager>, address: Address) -> Self {
        Self { provider, address }
    }

    /// L1 fee in wei for posting this calldata, or `None` when the oracle
    /// is unreachable (the cost model then falls back to a per-byte
    /// estimate).
    pub async fn l1_fee(&self, calldata: &Bytes) -> Option<u128> {
        let provider = build_http(self.provider.primary_url()).ok()?;
        let contract = IL1GasOracle::new(self.address, &provider);
        match contract.getL1Fee(calldata.clone()).call().await {
            Ok(result) => result._0.try_into().ok(),
            Err(e) => {
                warn!(oracle = %self.address, error = %e, "getL1Fee failed, falling back");
                None
            }
        }
    }
}
