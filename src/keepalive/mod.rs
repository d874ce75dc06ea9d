//! Keepalive monitor
//!
//! Pings the transport on a fixed interval and waits a bounded time for each
//! ping. A failed ping marks the connection degraded; a healthy one
//! restores it. Connection loss is declared after `max_missed` consecutive
//! failures, or on any failure once the last success is older than the hard
//! deadline. The monitor then fires the shutdown gate and stops.
//!
//! It never reconnects.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::session::{HealthCell, HealthState};
use crate::shutdown::{ShutdownGate, ShutdownReason};
use crate::transport::Dialer;

/// Keepalive configuration
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Interval between pings
    pub interval: Duration,
    /// Bound on a single ping
    pub ping_timeout: Duration,
    /// Consecutive failures treated as connection loss
    pub max_missed: u32,
    /// A failure this long after the last success is connection loss
    pub hard_deadline: Duration,
}

impl From<&ConnectionConfig> for KeepaliveConfig {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
            max_missed: config.max_missed_pings.max(1),
            hard_deadline: config.read_deadline,
        }
    }
}

pub struct KeepaliveMonitor {
    config: KeepaliveConfig,
    dialer: Arc<dyn Dialer>,
    gate: Arc<ShutdownGate>,
    health: Arc<HealthCell>,
}

impl KeepaliveMonitor {
    pub fn new(
        config: KeepaliveConfig,
        dialer: Arc<dyn Dialer>,
        gate: Arc<ShutdownGate>,
        health: Arc<HealthCell>,
    ) -> Self {
        Self {
            config,
            dialer,
            gate,
            health,
        }
    }

    /// Run until the gate fires or the connection is declared lost.
    pub async fn run(self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_missed = self.config.max_missed,
            "Starting keepalive monitor for {}",
            self.dialer.address()
        );

        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut missed: u32 = 0;
        let mut last_ok = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.gate.fired() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = self.gate.fired() => break,
                outcome = self.ping_once() => outcome,
            };

            match outcome {
                Ok(()) => {
                    if missed > 0 {
                        info!(missed, "Keepalive recovered");
                    }
                    missed = 0;
                    last_ok = Instant::now();
                    if self.health.transition(HealthState::Open) {
                        debug!("Connection health restored");
                    }
                }
                Err(reason) => {
                    missed += 1;
                    self.health.transition(HealthState::Degraded);
                    warn!(missed, %reason, "Keepalive ping failed");

                    let stale = last_ok.elapsed() >= self.config.hard_deadline;
                    if missed >= self.config.max_missed || stale {
                        warn!(missed, stale, "Keepalive declaring connection lost");
                        self.gate.fire(ShutdownReason::KeepaliveFailure);
                        break;
                    }
                }
            }
        }

        debug!("Keepalive monitor stopped");
    }

    async fn ping_once(&self) -> std::result::Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.dialer.ping(tx);

        match timeout(self.config.ping_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(_)) => Err("ping outcome dropped".to_string()),
            Err(_) => Err(format!(
                "no ping result within {:?}",
                self.config.ping_timeout
            )),
        }
    }
}
