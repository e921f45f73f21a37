use std::sync::Arc;
use std::time::Duration;

use relay_config::{DatabaseConfig, ReplicaConfig};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::breaker::ReplicaBreaker;
use crate::error::DalError;

/// Primary and optional replica pools plus the routing gate between them.
#[derive(Clone)]
pub struct DbPools {
    primary: PgPool,
    replica: Option<PgPool>,
    breaker: Arc<ReplicaBreaker>,
}

impl DbPools {
    /// Builds lazily-connecting pools; the first query opens connections.
    pub fn connect(
        database: &DatabaseConfig,
        replica: &ReplicaConfig,
        breaker: Arc<ReplicaBreaker>,
    ) -> Result<Self, DalError> {
        let primary = Self::build_pool(&database.url, database)?;
        let replica_pool = match &replica.url {
            Some(url) if replica.enabled => {
                info!("read replica routing enabled");
                Some(Self::build_pool(url, database)?)
            }
            _ => None,
        };
        Ok(Self {
            primary,
            replica: replica_pool,
            breaker,
        })
    }

    fn build_pool(url: &str, cfg: &DatabaseConfig) -> Result<PgPool, DalError> {
        PgPoolOptions::new()
            .min_connections(cfg.pool_min)
            .max_connections(cfg.pool_max.max(1))
            .acquire_timeout(cfg.connection_timeout)
            .idle_timeout(cfg.idle_timeout)
            .connect_lazy(url)
            .map_err(DalError::from)
    }

    pub fn primary(&self) -> &PgPool {
        &self.primary
    }

    pub fn breaker(&self) -> &Arc<ReplicaBreaker> {
        &self.breaker
    }

    /// Chooses the pool for a read. Replica-eligible reads go to the replica
    /// only while the breaker admits them; the second element says whether
    /// the replica was chosen so the caller can report the read's outcome.
    pub fn read_pool(&self, use_replica: bool) -> (&PgPool, bool) {
        if use_replica {
            if let Some(replica) = &self.replica {
                if self.breaker.allow_replica() {
                    return (replica, true);
                }
            }
        }
        (&self.primary, false)
    }

    /// Samples pool gauges: available/used/pending connection counts and a
    /// saturation ratio in [0, 1].
    pub fn record_metrics(&self) {
        let size = self.primary.size() as f64;
        let idle = self.primary.num_idle() as f64;
        let max = self.primary.options().get_max_connections() as f64;
        let used = (size - idle).max(0.0);
        metrics::gauge!("relay_db_pool_connections", "state" => "available").set(idle);
        metrics::gauge!("relay_db_pool_connections", "state" => "used").set(used);
        metrics::gauge!("relay_db_pool_connections", "state" => "pending")
            .set((max - size).max(0.0));
        metrics::gauge!("relay_db_pool_saturation").set(if max > 0.0 { used / max } else { 0.0 });
    }

    /// Periodically samples pool gauges until the pools are dropped.
    pub fn spawn_metrics_sampler(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let pools = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                pools.record_metrics();
            }
        })
    }
}
