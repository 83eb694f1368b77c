use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vorch::Config;
use vorch::executor::{DriverRegistry, Executors};
use vorch::manager::{Context, Managers};
use vorch::store::Store;
use vorch_log::{EventLog, EventLogger};

#[derive(Parser)]
#[command(name = "vorch")]
#[command(about = "Storage, volume, image, VM and network lifecycle daemon")]
struct Args {
    /// Directory holding the SQLite database
    #[arg(long, default_value = "/var/lib/vorch")]
    data_dir: String,

    /// Directory holding the event log
    #[arg(long, default_value = "/var/lib/vorch/log")]
    log_dir: PathBuf,

    /// Root under which storages are mounted
    #[arg(long, default_value = "/var/lib/vorch/mnt")]
    mount_root: PathBuf,

    /// Directory for generated domain definitions
    #[arg(long, default_value = "/var/lib/vorch/domains")]
    domain_dir: PathBuf,

    /// libvirt connection URI
    #[arg(long, default_value = "qemu:///system")]
    libvirt_uri: String,

    /// Seconds between reconciliation ticks
    #[arg(long, default_value_t = 10)]
    monitor_interval: u64,

    /// Upper bound in seconds for one reconciliation tick
    #[arg(long, default_value_t = 120)]
    tick_budget: u64,

    /// Upper bound in seconds for one executor call
    #[arg(long, default_value_t = 60)]
    call_timeout: u64,

    /// Snapshots a single VM may hold
    #[arg(long, default_value_t = 10)]
    max_snapshots: usize,

    /// SQLite connection pool size
    #[arg(long, default_value_t = 4)]
    db_connections: u32,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            call_timeout: Duration::from_secs(self.call_timeout),
            monitor_interval: Duration::from_secs(self.monitor_interval),
            tick_budget: Duration::from_secs(self.tick_budget),
            max_snapshots: self.max_snapshots,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vorch=info".parse()?))
        .init();

    let args = Args::parse();
    let config = args.config();
    info!(data_dir = %args.data_dir, ?config, "Initializing vorch");

    tokio::fs::create_dir_all(&args.data_dir).await?;
    tokio::fs::create_dir_all(&args.log_dir).await?;
    tokio::fs::create_dir_all(&args.domain_dir).await?;
    let store = Arc::new(
        Store::open(&args.data_dir, args.db_connections)
            .await
            .context("opening store")?,
    );
    let event_log = Arc::new(EventLog::open(&args.log_dir).context("opening event log")?);
    let events = EventLogger::new(event_log, "vorch");

    let registry = Arc::new(DriverRegistry::host(
        &args.mount_root,
        &args.libvirt_uri,
        &args.domain_dir,
    ));
    let (executors, executor_workers) = Executors::spawn(registry);

    let managers = Managers::start(Context {
        store,
        executors,
        events,
        config: config.clone(),
    });
    let monitors = managers.spawn_monitors(&config);
    info!(monitors = monitors.len(), "vorch running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    for monitor in monitors {
        monitor.shutdown().await;
    }
    managers.shutdown().await;
    for worker in executor_workers {
        worker.await?;
    }
    Ok(())
}
