//! Background sweeps: staleness and, optionally, connectivity probing.

use crate::config::ServerConfig;
use crate::fleet::FleetStatusService;
use crate::probe::ConnectivityProbe;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;

/// Upper bound on probes in flight during one sweep.
const MAX_CONCURRENT_PROBES: usize = 5;

/// Runs the periodic fleet sweeps until stopped.
pub struct Scheduler<P> {
    fleet: Arc<FleetStatusService<P>>,
    sweep_interval: Duration,
    probe_interval: Duration,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl<P: ConnectivityProbe + 'static> Scheduler<P> {
    pub fn new(fleet: Arc<FleetStatusService<P>>, config: &ServerConfig) -> Self {
        Self {
            fleet,
            sweep_interval: config.sweep_interval,
            probe_interval: config.probe_sweep_interval,
            stop: Mutex::new(None),
        }
    }

    /// Spawn the enabled sweep loops. A zero interval disables a loop.
    pub async fn start(&self) {
        let (tx, _) = broadcast::channel(1);

        if !self.sweep_interval.is_zero() {
            tracing::info!("Starting staleness sweep every {:?}", self.sweep_interval);
            tokio::spawn(run_staleness_loop(self.fleet.clone(), self.sweep_interval, tx.subscribe()));
        }
        if !self.probe_interval.is_zero() {
            tracing::info!("Starting probe sweep every {:?}", self.probe_interval);
            tokio::spawn(run_probe_loop(self.fleet.clone(), self.probe_interval, tx.subscribe()));
        }

        *self.stop.lock().await = Some(tx);
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.stop.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

async fn run_staleness_loop<P: ConnectivityProbe>(
    fleet: Arc<FleetStatusService<P>>,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                if let Err(e) = fleet.sweep_stale(Utc::now()) {
                    tracing::error!("Staleness sweep failed: {}", e);
                }
            }
        }
    }
}

async fn run_probe_loop<P: ConnectivityProbe + 'static>(
    fleet: Arc<FleetStatusService<P>>,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                let reachable = probe_all(&fleet).await;
                tracing::debug!("Probe sweep finished, {} device(s) reachable", reachable);
            }
        }
    }
}

/// Health-check every probeable device with bounded concurrency.
/// Returns how many answered.
pub async fn probe_all<P: ConnectivityProbe + 'static>(fleet: &Arc<FleetStatusService<P>>) -> usize {
    let targets = match fleet.probe_targets() {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("Probe sweep: failed to list devices: {}", e);
            return 0;
        }
    };

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
    let mut tasks = JoinSet::new();

    for device_id in targets {
        let fleet = fleet.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return false;
            };
            // Spread the probes out a little.
            let jitter = rand::random::<u64>() % 100;
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            match fleet.check_health(device_id, Utc::now()).await {
                Ok(check) => check.is_ok(),
                Err(e) => {
                    tracing::error!("Probe sweep: device {} failed: {}", device_id, e);
                    false
                }
            }
        });
    }

    let mut reachable = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(true) => reachable += 1,
            Ok(false) => {}
            Err(e) => tracing::error!("Probe sweep task panicked: {}", e),
        }
    }
    reachable
}
