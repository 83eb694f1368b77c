//! Periodic reconciliation.
//!
//! Every manager implements [`Monitor`]: one `tick` pulls all entities of
//! its kind, asks the executor what the backend looks like and writes the
//! corrections in a single bulk update. [`spawn`] runs ticks on a fixed
//! interval until the returned handle is shut down or dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Entities the executor was asked about.
    pub checked: usize,
    /// Entities left alone (status not monitored, parent unavailable).
    pub skipped: usize,
    /// Executor queries that failed.
    pub failed: usize,
    /// Corrections the store accepted.
    pub corrected: u64,
}

#[async_trait]
pub trait Monitor: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run one reconciliation pass. Per-entity failures are counted, not
    /// returned; an error means the pass itself could not run.
    async fn tick(&self) -> Result<TickReport>;
}

/// Handle to a running reconciliation loop.
pub struct MonitorHandle {
    name: &'static str,
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop after the tick in progress, if any, and wait for the loop to exit.
    pub async fn shutdown(self) {
        drop(self.stop_tx);
        if let Err(e) = self.handle.await {
            error!(monitor = self.name, error = %e, "Monitor task panicked");
        }
    }
}

/// Run `monitor` every `every`, giving each tick at most `budget`.
///
/// Ticks never overlap: the next one starts only after the previous one
/// finished or ran out of budget.
pub fn spawn<M: Monitor + ?Sized>(
    monitor: Arc<M>,
    every: Duration,
    budget: Duration,
) -> MonitorHandle {
    let name = monitor.name();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    let handle = tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(monitor = name, ?every, "Monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tokio::time::timeout(budget, monitor.tick()).await {
                        Ok(Ok(report)) => debug!(monitor = name, ?report, "Tick finished"),
                        Ok(Err(e)) => error!(monitor = name, error = %e, "Tick failed"),
                        Err(_) => warn!(monitor = name, ?budget, "Tick exceeded its budget"),
                    }
                }
                _ = stop_rx.recv() => {
                    info!(monitor = name, "Monitor stopping");
                    break;
                }
            }
        }
    });

    MonitorHandle {
        name,
        stop_tx,
        handle,
    }
}
