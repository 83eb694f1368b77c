use std::time::Duration;

/// Runtime settings shared by every manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound for one executor call.
    pub call_timeout: Duration,
    /// Time between reconciliation ticks.
    pub monitor_interval: Duration,
    /// Upper bound for one reconciliation tick.
    pub tick_budget: Duration,
    /// Snapshots a single VM may hold.
    pub max_snapshots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(10),
            tick_budget: Duration::from_secs(120),
            max_snapshots: 10,
        }
    }
}
