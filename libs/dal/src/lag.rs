use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::breaker::ReplicaBreaker;

const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct LagStatus {
    pub lag_seconds: f64,
    pub lag_bytes: f64,
    pub healthy: bool,
}

impl Default for LagStatus {
    fn default() -> Self {
        Self {
            lag_seconds: 0.0,
            lag_bytes: 0.0,
            healthy: true,
        }
    }
}

/// Polls the primary's replication status and feeds the replica breaker.
/// Three consecutive failed polls mark the replica unhealthy.
pub struct ReplicaLagMonitor {
    pool: PgPool,
    warning_secs: f64,
    breaker: Arc<ReplicaBreaker>,
    status: Mutex<LagStatus>,
    consecutive_failures: AtomicU32,
}

impl ReplicaLagMonitor {
    pub fn new(pool: PgPool, warning_secs: f64, breaker: Arc<ReplicaBreaker>) -> Self {
        Self {
            pool,
            warning_secs,
            breaker,
            status: Mutex::new(LagStatus::default()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> LagStatus {
        *self.status.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub async fn poll_once(&self) {
        let sample = self.fetch_sample().await;
        self.apply_sample(sample);
    }

    /// Runs the poll loop until the monitor is dropped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match monitor.upgrade() {
                    Some(monitor) => monitor.poll_once().await,
                    None => break,
                }
            }
        })
    }

    async fn fetch_sample(&self) -> Result<(f64, f64), String> {
        let row = sqlx::query(
            "SELECT \
                 COALESCE(MAX(EXTRACT(EPOCH FROM replay_lag)), 0)::float8 AS lag_seconds, \
                 COALESCE(MAX(pg_wal_lsn_diff(sent_lsn, replay_lsn)), 0)::float8 AS lag_bytes \
             FROM pg_stat_replication",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        let lag_seconds: f64 = row.try_get("lag_seconds").map_err(|err| err.to_string())?;
        let lag_bytes: f64 = row.try_get("lag_bytes").map_err(|err| err.to_string())?;
        Ok((lag_seconds, lag_bytes))
    }

    /// State update, separated from the query so the transition logic is
    /// testable without a database.
    pub fn apply_sample(&self, sample: Result<(f64, f64), String>) {
        match sample {
            Ok((lag_seconds, lag_bytes)) => {
                self.consecutive_failures.store(0, Ordering::Release);
                *self.status.lock().unwrap_or_else(|err| err.into_inner()) = LagStatus {
                    lag_seconds,
                    lag_bytes,
                    healthy: true,
                };
                metrics::gauge!("relay_replica_lag_seconds").set(lag_seconds);
                metrics::gauge!("relay_replica_lag_bytes").set(lag_bytes);
                metrics::gauge!("relay_replica_health").set(1.0);
                if lag_seconds >= self.warning_secs {
                    warn!(lag_seconds, "replication lag above warning threshold");
                } else {
                    debug!(lag_seconds, lag_bytes, "replication lag sampled");
                }
                self.breaker.observe(true, lag_seconds);
            }
            Err(reason) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(%reason, failures, "replication lag poll failed");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    let mut status =
                        self.status.lock().unwrap_or_else(|err| err.into_inner());
                    status.healthy = false;
                    drop(status);
                    metrics::gauge!("relay_replica_health").set(0.0);
                    self.breaker.observe(false, f64::MAX);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BreakerState;

    fn monitor_with_breaker() -> (ReplicaLagMonitor, Arc<ReplicaBreaker>) {
        let breaker = Arc::new(ReplicaBreaker::new(5.0, 10.0, Duration::ZERO));
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/relay_unused")
            .expect("lazy pool");
        (
            ReplicaLagMonitor::new(pool, 5.0, breaker.clone()),
            breaker,
        )
    }

    #[tokio::test]
    async fn critical_lag_opens_breaker() {
        let (monitor, breaker) = monitor_with_breaker();
        monitor.apply_sample(Ok((12.0, 4096.0)));
        monitor.apply_sample(Ok((12.5, 8192.0)));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(monitor.status().healthy);
        assert!(monitor.status().lag_seconds > 12.0);
    }

    #[tokio::test]
    async fn recovery_half_opens_then_probe_closes() {
        let (monitor, breaker) = monitor_with_breaker();
        monitor.apply_sample(Ok((12.0, 0.0)));
        monitor.apply_sample(Ok((1.0, 0.0)));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow_replica());
        breaker.record_result(true);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn three_failures_mark_unhealthy() {
        let (monitor, breaker) = monitor_with_breaker();
        monitor.apply_sample(Err("connection refused".into()));
        monitor.apply_sample(Err("connection refused".into()));
        assert!(monitor.status().healthy);
        assert_eq!(breaker.state(), BreakerState::Closed);

        monitor.apply_sample(Err("connection refused".into()));
        assert!(!monitor.status().healthy);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let (monitor, _) = monitor_with_breaker();
        monitor.apply_sample(Err("x".into()));
        monitor.apply_sample(Err("x".into()));
        monitor.apply_sample(Ok((0.5, 0.0)));
        monitor.apply_sample(Err("x".into()));
        assert!(monitor.status().healthy);
    }
}
