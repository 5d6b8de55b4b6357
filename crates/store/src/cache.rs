//! Two-layer position cache: Redis with an in-process fallback.
//!
//! Entries carry a soft 60 s TTL in both layers. Writes go to both layers
//! where possible; when the backend is unreachable every operation is
//! served from the in-process map and a rebuild is requested for the next
//! reconnect. The TTL is advisory (reconciliation rebuilds cheaply), not
//! a security boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use liquidator_core::config::RedisConfig;
use liquidator_core::error::CacheError;
use liquidator_core::traits::PositionStore;
use liquidator_core::types::Position;

/// Key of the monotonic block checkpoint.
const CHECKPOINT_KEY: &str = "checkpoint:last_block";

#[derive(Debug, Clone)]
struct FallbackEntry {
    position: Position,
    expires_at: Instant,
}

/// Cache statistics for the stats endpoint and the metrics exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub count: usize,
    pub per_protocol: HashMap<String, usize>,
    pub backend_healthy: bool,
    pub current_block: u64,
}

/// Keyed store of borrower positions.
pub struct PositionCache {
    backend: Option<redis::aio::ConnectionManager>,
    fallback: DashMap<String, FallbackEntry>,
    ttl: Duration,
    backend_healthy: AtomicBool,
    needs_rebuild: AtomicBool,
    current_block: AtomicU64,
    checkpoint_block: AtomicU64,
}

impl PositionCache {
    /// Connect to Redis; on failure, run fallback-only and request a
    /// rebuild for whenever the backend comes back.
    pub async fn connect(config: &RedisConfig) -> Self {
        let backend = match redis::Client::open(config.url.as_str()) {
            Ok(client) => match client.get_connection_manager().await {
                Ok(manager) => {
                    info!(url = %config.url, "position cache connected to redis");
                    Some(manager)
                }
                Err(e) => {
                    warn!(error = %e, "redis unreachable, using in-process cache only");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "invalid redis url, using in-process cache only");
                None
            }
        };
        let healthy = backend.is_some();
        Self {
            backend,
            fallback: DashMap::new(),
            ttl: Duration::from_secs(config.ttl_seconds),
            backend_healthy: AtomicBool::new(healthy),
            needs_rebuild: AtomicBool::new(false),
            current_block: AtomicU64::new(0),
            checkpoint_block: AtomicU64::new(0),
        }
    }

    /// Purely in-process cache (tests, and environments without Redis).
    pub fn in_memory(ttl_seconds: u64) -> Self {
        Self {
            backend: None,
            fallback: DashMap::new(),
            ttl: Duration::from_secs(ttl_seconds),
            backend_healthy: AtomicBool::new(false),
            needs_rebuild: AtomicBool::new(false),
            current_block: AtomicU64::new(0),
            checkpoint_block: AtomicU64::new(0),
        }
    }

    pub fn backend_healthy(&self) -> bool {
        self.backend_healthy.load(Ordering::Relaxed)
    }

    pub fn set_current_block(&self, block: u64) {
        self.current_block.store(block, Ordering::Relaxed);
    }

    pub fn current_block(&self) -> u64 {
        self.current_block.load(Ordering::Relaxed)
    }

    /// Probe the backend. A recovery (unhealthy -> healthy) requests a
    /// cache rebuild.
    pub async fn ping(&self) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        let mut connection = backend.clone();
        let alive = redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .is_ok();

        let was_healthy = self.backend_healthy.swap(alive, Ordering::Relaxed);
        if alive && !was_healthy {
            info!("cache backend recovered, scheduling rebuild");
            self.needs_rebuild.store(true, Ordering::Relaxed);
        } else if !alive && was_healthy {
            warn!("cache backend lost, falling back to in-process map");
        }
        alive
    }

    /// Take the pending rebuild request, if any.
    pub fn take_rebuild_request(&self) -> bool {
        self.needs_rebuild.swap(false, Ordering::Relaxed)
    }

    fn mark_backend_error(&self, context: &str, error: &redis::RedisError) {
        if self.backend_healthy.swap(false, Ordering::Relaxed) {
            warn!(context, error = %error, "cache backend error, switching to fallback");
        }
    }

    fn fallback_get(&self, key: &str) -> Option<Position> {
        let entry = self.fallback.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.fallback.remove(key);
            return None;
        }
        Some(entry.position.clone())
    }

    fn fallback_put(&self, position: &Position) {
        self.fallback.insert(
            position.key(),
            FallbackEntry { position: position.clone(), expires_at: Instant::now() + self.ttl },
        );
    }

    async fn backend_get(&self, key: &str) -> Option<Position> {
        if !self.backend_healthy() {
            return None;
        }
        let backend = self.backend.as_ref()?;
        let mut connection = backend.clone();
        match connection.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(position) => Some(position),
                Err(e) => {
                    warn!(key, error = %e, "corrupt cache entry, dropping");
                    let _ = connection.del::<_, ()>(key).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.mark_backend_error("get", &e);
                None
            }
        }
    }

    async fn backend_put(&self, position: &Position) {
        if !self.backend_healthy() {
            return;
        }
        let Some(backend) = &self.backend else { return };
        let mut connection = backend.clone();
        let raw = match serde_json::to_string(position) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "failed to encode position");
                return;
            }
        };
        if let Err(e) = connection
            .set_ex::<_, _, ()>(position.key(), raw, self.ttl.as_secs())
            .await
        {
            self.mark_backend_error("set", &e);
        }
    }

    /// Copy every live fallback entry into the backend. Called after a
    /// reconnect, before reconciliation re-verifies the amounts.
    pub async fn sync_fallback_to_backend(&self) -> usize {
        let mut synced = 0;
        let entries: Vec<Position> = self
            .fallback
            .iter()
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.position.clone())
            .collect();
        for position in entries {
            self.backend_put(&position).await;
            synced += 1;
        }
        info!(synced, "fallback entries synced to backend");
        synced
    }

    /// Persist the monotonic `last_processed_block` checkpoint.
    pub async fn save_checkpoint(&self, block: u64) {
        let previous = self.checkpoint_block.fetch_max(block, Ordering::Relaxed);
        if block < previous {
            debug!(block, previous, "checkpoint not advanced");
            return;
        }
        if self.backend_healthy() {
            if let Some(backend) = &self.backend {
                let mut connection = backend.clone();
                if let Err(e) = connection.set::<_, _, ()>(CHECKPOINT_KEY, block).await {
                    self.mark_backend_error("checkpoint", &e);
                }
            }
        }
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint_block.load(Ordering::Relaxed)
    }

    /// Cache statistics snapshot.
    pub async fn stats(&self) -> CacheStats {
        let positions = self.list_all().await;
        let mut per_protocol: HashMap<String, usize> = HashMap::new();
        for position in &positions {
            *per_protocol.entry(position.protocol.clone()).or_default() += 1;
        }
        CacheStats {
            count: positions.len(),
            per_protocol,
            backend_healthy: self.backend_healthy(),
            current_block: self.current_block(),
        }
    }
}

#[async_trait]
impl PositionStore for PositionCache {
    async fn get(&self, protocol: &str, user: Address) -> Option<Position> {
        let key = Position::cache_key(protocol, user);
        if let Some(position) = self.backend_get(&key).await {
            return Some(position);
        }
        self.fallback_get(&key)
    }

    async fn list_all(&self) -> Vec<Position> {
        let mut by_key: HashMap<String, Position> = HashMap::new();

        if self.backend_healthy() {
            if let Some(backend) = &self.backend {
                let mut connection = backend.clone();
                match connection.keys::<_, Vec<String>>("position:*").await {
                    Ok(keys) => {
                        for key in keys {
                            if let Some(position) = self.backend_get(&key).await {
                                by_key.insert(key, position);
                            }
                        }
                    }
                    Err(e) => self.mark_backend_error("keys", &e),
                }
            }
        }

        // Merge live fallback entries the backend does not have.
        let now = Instant::now();
        for entry in self.fallback.iter() {
            if entry.expires_at > now {
                by_key
                    .entry(entry.key().clone())
                    .or_insert_with(|| entry.position.clone());
            }
        }

        by_key.into_values().collect()
    }

    async fn upsert(&self, position: Position) -> Result<(), CacheError> {
        self.backend_put(&position).await;
        self.fallback_put(&position);
        Ok(())
    }

    async fn update_health(
        &self,
        protocol: &str,
        user: Address,
        is_healthy: bool,
        block: u64,
    ) -> Result<Option<Position>, CacheError> {
        let Some(mut position) = self.get(protocol, user).await else {
            debug!(protocol, user = %user, "health update for unknown position");
            return Ok(None);
        };

        if is_healthy {
            position.blocks_unhealthy = 0;
        } else {
            position.blocks_unhealthy += 1;
        }
        position.last_update_block = position.last_update_block.max(block);

        self.backend_put(&position).await;
        self.fallback_put(&position);
        Ok(Some(position))
    }

    async fn remove(&self, protocol: &str, user: Address) -> Result<(), CacheError> {
        let key = Position::cache_key(protocol, user);
        if self.backend_healthy() {
            if let Some(backend) = &self.backend {
                let mut connection = backend.clone();
                if let Err(e) = connection.del::<_, ()>(&key).await {
                    self.mark_backend_error("del", &e);
                }
            }
        }
        self.fallback.remove(&key);
        Ok(())
    }
}
