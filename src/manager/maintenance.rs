//! Background upkeep: idle-connection reaper and cache TTL sweeper.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ProviderResilienceManager;

/// Intervals for the two background tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceConfig {
    /// How often idle connections and DNS entries are reaped. Default: 30s.
    pub reap_interval: Duration,
    /// How often expired cache entries are purged. Default: 60s.
    pub sweep_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl MaintenanceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reap_interval(mut self, every: Duration) -> Self {
        self.reap_interval = every;
        self
    }

    pub fn sweep_interval(mut self, every: Duration) -> Self {
        self.sweep_interval = every;
        self
    }
}

/// Owns the background tasks. Dropping it stops them.
#[derive(Debug)]
pub struct MaintenanceHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Signal the tasks to stop without waiting for them.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }

    /// Stop the tasks and wait until they have exited.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl ProviderResilienceManager {
    /// Spawn the idle reaper and the cache sweeper on the current tokio
    /// runtime. The first pass of each runs one interval after spawning.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, or with a zero interval.
    pub fn spawn_maintenance(&self, config: MaintenanceConfig) -> MaintenanceHandle {
        let token = CancellationToken::new();

        let pool = self.pool.clone();
        let reaper = spawn_periodic(token.clone(), config.reap_interval, move || {
            let closed = pool.reap_idle();
            debug!(closed, "idle reaper pass");
        });

        let cache = self.cache.clone();
        let sweeper = spawn_periodic(token.clone(), config.sweep_interval, move || {
            let purged = cache.purge_expired();
            debug!(purged, "cache sweeper pass");
        });

        MaintenanceHandle {
            token,
            tasks: vec![reaper, sweeper],
        }
    }
}

fn spawn_periodic<F>(token: CancellationToken, every: Duration, mut pass: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => pass(),
            }
        }
    })
}
