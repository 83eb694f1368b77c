use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, error};

use crate::storage::EventLog;
use crate::Event;

const BATCH_SIZE: usize = 100;
const FLUSH_TIMEOUT: Duration = Duration::from_millis(50);

/// Collects events and writes them to the log in batches.
///
/// A batch is flushed once it holds `BATCH_SIZE` events or no new event
/// arrived for `FLUSH_TIMEOUT`.
#[derive(Clone)]
pub struct Batcher {
    tx: mpsc::UnboundedSender<Event>,
}

impl Batcher {
    /// Spawn the flush loop. Must be called from within a tokio runtime.
    pub fn new(log: Arc<EventLog>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_loop(rx, log));
        Self { tx }
    }

    pub fn submit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

async fn run_loop(mut rx: mpsc::UnboundedReceiver<Event>, log: Arc<EventLog>) {
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        batch.push(first);

        while batch.len() < BATCH_SIZE {
            match timeout(FLUSH_TIMEOUT, rx.recv()).await {
                Ok(Some(event)) => batch.push(event),
                Ok(None) | Err(_) => break,
            }
        }

        let len = batch.len();
        let log = log.clone();
        match tokio::task::spawn_blocking(move || log.append_batch(batch)).await {
            Ok(Ok(())) => debug!("Flushed {len} events"),
            Ok(Err(e)) => error!("Event batch flush failed: {e:#}"),
            Err(e) => error!("Event batch flush task failed: {e}"),
        }
    }

    debug!("Event batcher shutdown");
}
