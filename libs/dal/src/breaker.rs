use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

/// Replica routing gate.
///
/// `Closed` routes replica-eligible reads to the replica. `Open` forces the
/// primary. `HalfOpen` admits exactly one probe read after the cooldown;
/// its outcome decides which way the gate flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct ReplicaBreaker {
    warning_secs: f64,
    critical_secs: f64,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl ReplicaBreaker {
    pub fn new(warning_secs: f64, critical_secs: f64, cooldown: Duration) -> Self {
        Self {
            warning_secs,
            critical_secs,
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Feeds a lag observation into the gate. Unhealthy or critically lagged
    /// opens it; a recovered lag (below warning) moves an open gate to
    /// half-open once the cooldown has passed.
    pub fn observe(&self, healthy: bool, lag_seconds: f64) {
        let mut inner = self.lock();
        if !healthy || lag_seconds >= self.critical_secs {
            if inner.state != BreakerState::Open {
                info!(lag_seconds, healthy, "replica breaker opened");
            }
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
        } else if inner.state == BreakerState::Open
            && lag_seconds < self.warning_secs
            && inner
                .opened_at
                .is_none_or(|at| at.elapsed() >= self.cooldown)
        {
            info!(lag_seconds, "replica breaker half-open, probing");
            inner.state = BreakerState::HalfOpen;
            inner.probe_in_flight = false;
        }
        Self::record_state(inner.state);
    }

    /// Whether the next replica-eligible read may go to the replica. In
    /// half-open state only a single probe is admitted at a time.
    pub fn allow_replica(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Reports the outcome of a replica read. A failed read reopens the gate
    /// from any state; a successful half-open probe closes it.
    pub fn record_result(&self, success: bool) {
        let mut inner = self.lock();
        match (inner.state, success) {
            (BreakerState::HalfOpen, true) => {
                info!("replica breaker closed after successful probe");
                inner.state = BreakerState::Closed;
                inner.opened_at = None;
            }
            (_, false) => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {}
        }
        inner.probe_in_flight = false;
        Self::record_state(inner.state);
    }

    fn record_state(state: BreakerState) {
        let value = match state {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        };
        metrics::gauge!("relay_replica_breaker_state").set(value);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}
