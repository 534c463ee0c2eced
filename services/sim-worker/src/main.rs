//! Simulated worker process for the device pool agent.
//!
//! Usage: `sim-worker <worker-name> <coordinator-addr> <backend> <otr-only>`

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing::{error, info};

use devpool_sim_worker::{logging, run, WorkerOptions};

#[derive(Parser, Debug)]
#[command(name = "sim-worker", version, about = "Hosts simulated devices for the pool agent")]
struct Args {
    /// Name the worker registers under.
    worker_name: String,

    /// Coordinator address to connect back to.
    coordinator_addr: SocketAddr,

    /// Backend the devices talk to.
    backend: String,

    /// Only allow OTR conversations.
    #[arg(action = ArgAction::Set)]
    otr_only: bool,

    /// Extra latency before answering device requests.
    #[arg(long, env = "SIM_WORKER_RESPONSE_DELAY_MS", default_value_t = 0)]
    response_delay_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::from(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        worker = %args.worker_name,
        "sim-worker starting"
    );

    let options = WorkerOptions {
        worker_name: args.worker_name,
        coordinator_addr: args.coordinator_addr,
        backend: args.backend,
        otr_only: args.otr_only,
        response_delay: Duration::from_millis(args.response_delay_ms),
    };

    match run(options).await {
        Ok(exit) => {
            info!(exit = ?exit, "sim-worker exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, reason = e.reason_code(), "sim-worker failed");
            ExitCode::from(1)
        }
    }
}
