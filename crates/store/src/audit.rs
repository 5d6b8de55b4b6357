//! Durable audit log over Postgres.
//!
//! Append-mostly tables for execution records, state divergences,
//! performance metrics and system events. While the database is
//! unreachable, rows queue in memory (FIFO, capacity 100, drop-oldest)
//! and flush once it recovers. A sink failure never fails a trading
//! decision.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use liquidator_core::config::DatabaseConfig;
use liquidator_core::error::DatabaseError;
use liquidator_core::traits::AuditSink;
use liquidator_core::types::{
    ExecutionRecord, PerformanceMetrics, StateDivergence, SystemEvent,
};

/// In-memory queue capacity during database outages.
const QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
enum AuditRow {
    Execution(Box<ExecutionRecord>),
    Divergence(StateDivergence),
    Metrics(PerformanceMetrics),
    Event(SystemEvent),
}

/// Audit log with outage queueing.
pub struct AuditLog {
    pool: Option<PgPool>,
    queue: Mutex<VecDeque<AuditRow>>,
    available: AtomicBool,
}

impl AuditLog {
    /// Connect and run migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| DatabaseError::Unavailable(e.to_string()))?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Unavailable(format!("migrations failed: {e}")))?;

        info!("audit log connected");
        Ok(Self {
            pool: Some(pool),
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            available: AtomicBool::new(true),
        })
    }

    /// Queue-only audit log (tests, and boots where the database is
    /// intentionally absent).
    pub fn disconnected() -> Self {
        Self {
            pool: None,
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            available: AtomicBool::new(false),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Probe the database; a recovery triggers a queue flush by the
    /// monitor task.
    pub async fn health_check(&self) -> bool {
        let Some(pool) = &self.pool else { return false };
        let alive = sqlx::query("SELECT 1").execute(pool).await.is_ok();
        let was = self.available.swap(alive, Ordering::Relaxed);
        if alive && !was {
            info!("audit database recovered");
        } else if !alive && was {
            warn!("audit database lost, queueing rows in memory");
        }
        alive
    }

    fn enqueue(&self, row: AuditRow) {
        let mut queue = self.queue.lock();
        if queue.len() == QUEUE_CAPACITY {
            queue.pop_front();
            warn!("audit queue full, dropped oldest row");
        }
        queue.push_back(row);
        debug!(queued = queue.len(), "audit row queued");
    }

    /// Drain the queue while inserts succeed. Returns how many rows were
    /// flushed.
    pub async fn flush(&self) -> usize {
        let mut flushed = 0;
        loop {
            let next = {
                let mut queue = self.queue.lock();
                queue.pop_front()
            };
            let Some(row) = next else { break };

            if let Err(e) = self.insert(&row).await {
                warn!(error = %e, flushed, "flush interrupted, re-queueing row");
                self.queue.lock().push_front(row);
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            info!(flushed, "audit queue flushed");
        }
        flushed
    }

    async fn write(&self, row: AuditRow) -> Result<(), DatabaseError> {
        if !self.is_available() {
            self.enqueue(row);
            return Ok(());
        }
        if let Err(e) = self.insert(&row).await {
            self.available.store(false, Ordering::Relaxed);
            warn!(error = %e, "audit insert failed, queueing");
            self.enqueue(row);
        }
        Ok(())
    }

    async fn insert(&self, row: &AuditRow) -> Result<(), DatabaseError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| DatabaseError::Unavailable("no pool".to_string()))?;

        match row {
            AuditRow::Execution(record) => {
                sqlx::query(
                    r#"
                    INSERT INTO executions (
                        timestamp, block_number, protocol, borrower,
                        collateral_asset, debt_asset, health_factor,
                        simulation_success, simulated_profit_wei, simulated_profit_usd,
                        bundle_submitted, tx_hash, submission_path, bribe_usd,
                        status, included, inclusion_block,
                        actual_profit_wei, actual_profit_usd,
                        state_at_execution, rejection_reason
                    ) VALUES (
                        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                        $13, $14, $15, $16, $17, $18, $19, $20, $21
                    )
                    "#,
                )
                .bind(record.timestamp)
                .bind(record.block_number as i64)
                .bind(&record.protocol)
                .bind(format!("{:#x}", record.borrower))
                .bind(format!("{:#x}", record.collateral_asset))
                .bind(format!("{:#x}", record.debt_asset))
                .bind(record.health_factor)
                .bind(record.simulation_success)
                .bind(record.simulated_profit_wei.map(|w| w.to_string()))
                .bind(record.simulated_profit_usd)
                .bind(record.bundle_submitted)
                .bind(record.tx_hash.map(|h| format!("{h:#x}")))
                .bind(record.submission_path.map(|p| p.as_str()))
                .bind(record.bribe_usd)
                .bind(record.status.as_str())
                .bind(record.included)
                .bind(record.inclusion_block.map(|b| b as i64))
                .bind(record.actual_profit_wei.map(|w| w.to_string()))
                .bind(record.actual_profit_usd)
                .bind(record.state_at_execution.as_str())
                .bind(&record.rejection_reason)
                .execute(pool)
                .await
                .map_err(|e| DatabaseError::WriteFailed(e.to_string()))?;
            }
            AuditRow::Divergence(divergence) => {
                sqlx::query(
                    r#"
                    INSERT INTO state_divergences (
                        timestamp, block_number, protocol, "user", field,
                        cached_value, canonical_value, divergence_bps
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(divergence.timestamp)
                .bind(divergence.block_number as i64)
                .bind(&divergence.protocol)
                .bind(format!("{:#x}", divergence.user))
                .bind(&divergence.field)
                .bind(divergence.cached_value.to_string())
                .bind(divergence.canonical_value.to_string())
                .bind(divergence.divergence_bps as i64)
                .execute(pool)
                .await
                .map_err(|e| DatabaseError::WriteFailed(e.to_string()))?;
            }
            AuditRow::Metrics(metrics) => {
                sqlx::query(
                    r#"
                    INSERT INTO performance_metrics (
                        timestamp, window_size, total_submissions,
                        successful_inclusions, inclusion_rate,
                        total_executions, simulation_accuracy,
                        total_profit_usd, average_profit_usd,
                        consecutive_failures
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#,
                )
                .bind(metrics.timestamp)
                .bind(metrics.window_size as i32)
                .bind(metrics.total_submissions as i32)
                .bind(metrics.successful_inclusions as i32)
                .bind(metrics.inclusion_rate)
                .bind(metrics.total_executions as i32)
                .bind(metrics.simulation_accuracy)
                .bind(metrics.total_profit_usd)
                .bind(metrics.average_profit_usd)
                .bind(metrics.consecutive_failures as i32)
                .execute(pool)
                .await
                .map_err(|e| DatabaseError::WriteFailed(e.to_string()))?;
            }
            AuditRow::Event(event) => {
                sqlx::query(
                    r#"
                    INSERT INTO system_events (
                        timestamp, event_type, severity, message, context
                    ) VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(event.timestamp)
                .bind(&event.event_type)
                .bind(&event.severity)
                .bind(&event.message)
                .bind(event.context.to_string())
                .execute(pool)
                .await
                .map_err(|e| DatabaseError::WriteFailed(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError> {
        self.write(AuditRow::Execution(Box::new(record.clone()))).await
    }

    async fn record_divergence(&self, divergence: &StateDivergence) -> Result<(), DatabaseError> {
        self.write(AuditRow::Divergence(divergence.clone())).await
    }

    async fn record_metrics(&self, metrics: &PerformanceMetrics) -> Result<(), DatabaseError> {
        self.write(AuditRow::Metrics(metrics.clone())).await
    }

    async fn record_event(&self, event: &SystemEvent) -> Result<(), DatabaseError> {
        self.write(AuditRow::Event(event.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(n: usize) -> SystemEvent {
        SystemEvent::new("test", "LOW", format!("event {n}"), json!({ "n": n }))
    }

    #[tokio::test]
    async fn disconnected_log_queues_rows() {
        let log = AuditLog::disconnected();
        assert!(!log.is_available());

        for n in 0..5 {
            log.record_event(&event(n)).await.unwrap();
        }
        assert_eq!(log.queued(), 5);
    }

    #[tokio::test]
    async fn queue_caps_at_one_hundred_dropping_oldest() {
        let log = AuditLog::disconnected();
        for n in 0..105 {
            log.record_event(&event(n)).await.unwrap();
        }
        assert_eq!(log.queued(), 100);

        // Oldest five were dropped: head of queue is event 5.
        let head = log.queue.lock().front().cloned().unwrap();
        match head {
            AuditRow::Event(e) => assert_eq!(e.message, "event 5"),
            other => panic!("unexpected row {other:?}"),
        }
    }

    #[tokio::test]
    async fn flush_without_pool_requeues_and_stops() {
        let log = AuditLog::disconnected();
        log.record_event(&event(0)).await.unwrap();
        assert_eq!(log.flush().await, 0);
        assert_eq!(log.queued(), 1);
    }

    #[tokio::test]
    async fn health_check_without_pool_is_false() {
        let log = AuditLog::disconnected();
        assert!(!log.health_check().await);
    }
}
