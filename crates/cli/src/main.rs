mod config;
mod diagnostics;
mod error;
mod inventory;
mod logging;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use podlink_forward::{Fleet, RetryPolicy, SessionDeps, SessionExit, DEFAULT_NAMESPACE};
use podlink_transport::QuicConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use error::{Error, Result};
use inventory::InventoryResolver;

#[derive(Parser, Debug)]
#[command(name = "podlink", about = "Forward local TCP ports to services behind relays")]
struct Args {
    /// YAML file listing `localPort:[namespace:]name:port` descriptors.
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Inventory of services and instances [default: ~/.podlink/inventory.yaml]
    #[arg(long)]
    inventory: Option<PathBuf>,

    /// Namespace for descriptors that omit one.
    #[arg(short = 'n', long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Local address the forwarded ports listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    bind: IpAddr,

    /// Periodically log task, memory and session counters.
    #[arg(long, default_value_t = false)]
    monitor: bool,

    /// Seconds between diagnostics reports.
    #[arg(long, default_value_t = 60)]
    monitor_interval: u64,

    /// Give up on a mapping after this many consecutive failed attempts.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// First reconnect delay in milliseconds; doubles on each failure.
    #[arg(long, default_value_t = 1000)]
    retry_initial_ms: u64,

    /// Upper bound on the reconnect delay in seconds.
    #[arg(long, default_value_t = 60)]
    retry_max_secs: u64,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short = 'v', long, default_value_t = false)]
    verbose: bool,
}

impl Args {
    fn inventory_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.inventory {
            return Ok(path.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".podlink").join("inventory.yaml"))
            .ok_or_else(|| Error::Config("no home directory, pass --inventory".into()))
    }

    fn retry_policy(&self) -> Result<RetryPolicy> {
        if self.max_attempts == Some(0) {
            return Err(Error::Config("--max-attempts must be at least 1".into()));
        }
        let initial = Duration::from_millis(self.retry_initial_ms);
        let max = Duration::from_secs(self.retry_max_secs);
        if initial.is_zero() || initial > max {
            return Err(Error::Config(format!(
                "retry delays must satisfy 0 < initial ({initial:?}) <= max ({max:?})"
            )));
        }
        Ok(RetryPolicy::exponential(initial, max, self.max_attempts))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init_logging(args.verbose);

    let mappings = config::load_mappings(&args.file, &args.namespace)?;
    let inventory = args.inventory_path()?;
    let retry = args.retry_policy()?;
    info!(
        mappings = mappings.len(),
        inventory = %inventory.display(),
        "starting podlink"
    );

    let connector = Arc::new(QuicConnector::new(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        0,
    ))?);
    let deps = SessionDeps::new(Arc::new(InventoryResolver::new(inventory)), connector.clone())
        .with_retry(retry)
        .with_bind_address(args.bind);

    let shutdown = CancellationToken::new();
    let fleet = Fleet::spawn(mappings, deps, shutdown.clone())?;

    let monitor_cancel = CancellationToken::new();
    let monitor = args.monitor.then(|| {
        diagnostics::spawn(
            fleet.sessions().to_vec(),
            Duration::from_secs(args.monitor_interval.max(1)),
            monitor_cancel.clone(),
        )
    });

    let ctrl_c = {
        let shutdown = fleet.shutdown_token();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("received Ctrl-C, shutting down"),
                Err(e) => error!(%e, "cannot listen for Ctrl-C, shutting down"),
            }
            shutdown.cancel();
        })
    };

    let reports = fleet.wait().await;
    ctrl_c.abort();
    monitor_cancel.cancel();
    if let Some(monitor) = monitor {
        if let Err(e) = monitor.await {
            debug!(%e, "diagnostics task ended abnormally");
        }
    }
    connector.shutdown().await;

    // Sessions only end on their own when every one of them gave up.
    let failed = reports
        .iter()
        .filter(|report| !matches!(report.exit, Some(SessionExit::Terminated)))
        .count();
    if shutdown.is_cancelled() || failed == 0 {
        info!("all sessions stopped");
        Ok(())
    } else {
        Err(Error::Abandoned {
            failed,
            total: reports.len(),
        })
    }
}
