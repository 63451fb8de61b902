//! Recurring sweep task
//!
//! Owned by the process, not by a request. Runs the reconciler on a fixed
//! cadence, wakes early on `trigger()`, and shuts down on `stop()`. While the
//! market is closed, scheduled ticks are skipped after the first one in each
//! closed period unless `sweep_when_closed` is set, so expiration and cleanup
//! still happen once per closed period.

use crate::reconcile::Reconciler;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SweepScheduler {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    sweep_when_closed: bool,
    wake: Arc<Notify>,
    running: Mutex<Option<Running>>,
}

impl SweepScheduler {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
            sweep_when_closed: false,
            wake: Arc::new(Notify::new()),
            running: Mutex::new(None),
        }
    }

    pub fn sweep_when_closed(mut self, enabled: bool) -> Self {
        self.sweep_when_closed = enabled;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |r| !r.handle.is_finished())
    }

    /// Spawn the sweep loop. Does nothing if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().map_or(false, |r| !r.handle.is_finished()) {
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(sweep_loop(
            Arc::clone(&self.reconciler),
            self.interval,
            self.sweep_when_closed,
            Arc::clone(&self.wake),
            shutdown_rx,
        ));
        log::info!("Sweep scheduler started, every {:?}", self.interval);
        *running = Some(Running { shutdown, handle });
    }

    /// Run a sweep now instead of waiting for the next tick
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Stop the loop and wait for an in-flight sweep to finish
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Running { shutdown, handle }) = running {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                log::warn!("Sweep task ended abnormally: {}", e);
            }
            log::info!("Sweep scheduler stopped");
        }
    }
}

impl std::fmt::Debug for SweepScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepScheduler")
            .field("interval", &self.interval)
            .field("sweep_when_closed", &self.sweep_when_closed)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn sweep_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    sweep_when_closed: bool,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut swept_while_closed = false;

    loop {
        let forced = tokio::select! {
            _ = ticker.tick() => false,
            _ = wake.notified() => true,
            _ = shutdown.changed() => break,
        };

        let engine = reconciler.engine();
        let status = engine.oracle().status(engine.clock().now());
        if status.can_execute_orders {
            swept_while_closed = false;
        } else if !forced && !sweep_when_closed && swept_while_closed {
            log::debug!("Market {}, skipping scheduled sweep", status.market_state);
            continue;
        } else {
            swept_while_closed = true;
        }

        if let Err(e) = reconciler.run_once().await {
            log::error!("Sweep failed: {}", e);
        }
    }
}
