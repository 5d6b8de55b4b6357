//! WebSocket block-header subscription with reconnection and failover.
//!
//! Subscribes to `newHeads` on the primary endpoint. Disconnects trigger
//! exponential backoff (1 s doubling, capped at 60 s); after the attempt
//! budget is spent on the primary the listener fails over to the backup
//! and resets the counter. When the backup exhausts its budget too, `run`
//! returns an error and the orchestrator halts the system.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use liquidator_core::config::RpcConfig;
use liquidator_core::error::RpcError;

/// Base reconnect delay, doubled per attempt.
const BASE_BACKOFF_SECS: u64 = 1;

/// Backoff ceiling.
const MAX_BACKOFF_SECS: u64 = 60;

/// Reconnect attempts per endpoint before failing over.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// A connection with no message for this long is considered dead. This is
/// the transport-level stand-in for a 20 s ping / 10 s pong cycle.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Decoded `newHeads` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHead {
    pub number: u64,
    pub timestamp: u64,
}

/// WebSocket listener over a primary/backup endpoint pair.
pub struct WsListener {
    primary_ws: String,
    backup_ws: String,
    on_primary: AtomicBool,
    connected: AtomicBool,
    last_message_at: Mutex<Instant>,
}

impl WsListener {
    pub fn new(rpc: &RpcConfig) -> Self {
        Self {
            primary_ws: rpc.primary_ws.clone(),
            backup_ws: rpc.backup_ws.clone(),
            on_primary: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            last_message_at: Mutex::new(Instant::now()),
        }
    }

    /// Health view polled every 5 s by the monitor task: healthy means
    /// connected and a message arrived within the last 30 s.
    pub fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
            && self.last_message_at.lock().elapsed() < IDLE_TIMEOUT
    }

    /// Seconds since the last received message.
    pub fn idle_seconds(&self) -> u64 {
        self.last_message_at.lock().elapsed().as_secs()
    }

    fn current_url(&self) -> &str {
        if self.on_primary.load(Ordering::Relaxed) {
            &self.primary_ws
        } else {
            &self.backup_ws
        }
    }

    /// Stream block heads into `heads` until shutdown or until both
    /// endpoints are exhausted.
    pub async fn run(
        &self,
        heads: mpsc::Sender<BlockHead>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RpcError> {
        let mut reconnect_attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let url = self.current_url().to_string();
            let endpoint = if self.on_primary.load(Ordering::Relaxed) { "primary" } else { "backup" };

            match self.stream_once(&url, &heads, &mut shutdown).await {
                Ok(()) => return Ok(()), // clean shutdown
                Err(e) => {
                    self.connected.store(false, Ordering::Relaxed);
                    warn!(endpoint, error = %e, "websocket connection lost");
                }
            }

            reconnect_attempts += 1;
            if reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
                if self.on_primary.swap(false, Ordering::Relaxed) {
                    info!("primary websocket exhausted, failing over to backup");
                    reconnect_attempts = 0;
                } else {
                    return Err(RpcError::AllProvidersFailed(
                        "both websocket endpoints exhausted their reconnect budget".to_string(),
                    ));
                }
            }

            let backoff = backoff_secs(reconnect_attempts);
            info!(endpoint, attempt = reconnect_attempts, backoff_secs = backoff, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// One connection lifetime: connect, subscribe, forward heads until
    /// the stream dies, goes idle, or shutdown is signalled.
    async fn stream_once(
        &self,
        url: &str,
        heads: &mpsc::Sender<BlockHead>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), RpcError> {
        info!(url, "connecting websocket");
        let ws = WsConnect::new(url);
        let provider = ProviderBuilder::new()
            .on_ws(ws)
            .await
            .map_err(|e| RpcError::WsClosed(e.to_string()))?;

        let subscription = provider
            .subscribe_blocks()
            .await
            .map_err(|e| RpcError::WsClosed(e.to_string()))?;
        let mut stream = subscription.into_stream();

        self.connected.store(true, Ordering::Relaxed);
        *self.last_message_at.lock() = Instant::now();
        info!(url, "subscribed to newHeads");

        loop {
            tokio::select! {
                next = tokio::time::timeout(IDLE_TIMEOUT, stream.next()) => {
                    match next {
                        Ok(Some(header)) => {
                            *self.last_message_at.lock() = Instant::now();
                            let head = BlockHead {
                                number: header.number,
                                timestamp: header.timestamp,
                            };
                            if heads.send(head).await.is_err() {
                                // Receiver dropped: the engine is gone.
                                return Ok(());
                            }
                        }
                        Ok(None) => {
                            return Err(RpcError::WsClosed("subscription ended".to_string()));
                        }
                        Err(_) => {
                            return Err(RpcError::WsClosed(format!(
                                "no message in {} s",
                                IDLE_TIMEOUT.as_secs()
                            )));
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("websocket listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

fn backoff_secs(attempt: u32) -> u64 {
    BASE_BACKOFF_SECS
        .saturating_mul(1u64 << attempt.saturating_sub(1).min(6))
        .min(MAX_BACKOFF_SECS)
}
