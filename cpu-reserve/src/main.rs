//! cpu-reserved - CPU reservation admission control daemon
//!
//! Provides:
//! - Admission of periodic CPU reservations with response-time analysis
//! - Delayed-preemption bookkeeping
//! - Preemption watchers with overrun counters and deadline histograms

use anyhow::Result;
use clap::Parser;
use cpu_reserve::config::CpuReserveConfig;
use cpu_reserve::ipc::IpcServer;
use cpu_reserve::kernel::SimulatedKernel;
use cpu_reserve::reservation::CONTROL_ID;
use cpu_reserve::Controller;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CPU reservation daemon
#[derive(Parser, Debug)]
#[command(name = "cpu-reserved", version, about)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cpu-reserve/cpu-reserve.toml")]
    config: PathBuf,

    /// Maximum number of reservations
    #[arg(short, long)]
    threads: Option<usize>,

    /// Log every schedulability check
    #[arg(short, long)]
    verbose: bool,

    /// Log every observed preemption
    #[arg(short, long)]
    watch_verbose: bool,

    /// Record deadline histograms for watched reservations
    #[arg(short, long)]
    monitor: bool,

    /// Socket path
    #[arg(long, env = "CPU_RESERVE_SOCKET")]
    socket: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = CpuReserveConfig::load(&args.config)?;
    if let Some(threads) = args.threads {
        config.table.max_reservations = threads;
    }
    if let Some(socket) = args.socket {
        config.daemon.socket_path = socket;
    }
    config.watch.verbose |= args.watch_verbose;
    config.watch.monitor |= args.monitor;

    // Initialize logging
    let log_level = if args.verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    info!("cpu-reserved v{} starting", VERSION);
    info!(
        "Configuration loaded from {:?}: {} reservations max, monitor={}",
        args.config, config.table.max_reservations, config.watch.monitor
    );

    let kernel = Arc::new(SimulatedKernel::new(config.kernel.granularity_us));
    let controller = Arc::new(Controller::new(kernel, CONTROL_ID, &config));
    info!("Scheduler granularity: {}us", controller.granularity());

    let server = IpcServer::new(&config.daemon.socket_path, controller);

    info!("cpu-reserved ready");
    server.run().await
}
