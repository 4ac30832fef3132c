//! clat-coordinator daemon: brings 464xlat up for an IPv6-only uplink and
//! tears it down again on SIGINT/SIGTERM.

use clap::Parser;
use clat_coordinator::{ClatCoordinator, SysDeps};
use ipnet::Ipv6Net;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "clat-coordinator", about = "464xlat control coordinator")]
struct Args {
    /// IPv6-only uplink interface to translate for (e.g. wlan0)
    #[arg(short, long)]
    iface: String,

    /// Network id encoded into the firewall mark
    #[arg(long, default_value_t = 0)]
    net_id: u32,

    /// NAT64 prefix, must be a /96 (e.g. 64:ff9b::/96)
    #[arg(short = 'p', long, default_value = "64:ff9b::/96")]
    nat64_prefix: Ipv6Net,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let mut coordinator = ClatCoordinator::new(SysDeps::new());
    match coordinator.start(&args.iface, args.net_id, args.nat64_prefix) {
        Ok(v6) => info!(iface = %args.iface, v6 = %v6, "clat running"),
        Err(e) => {
            error!(error = %e, "failed to start clat");
            std::process::exit(1);
        }
    }

    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => { info!("Received SIGINT"); }
        _ = sigterm.recv() => { info!("Received SIGTERM"); }
    }

    let mut stdout = std::io::stdout();
    if let Err(e) = coordinator.dump(&mut stdout) {
        error!(error = %e, "dump failed");
    }

    if let Err(e) = coordinator.stop() {
        error!(error = %e, "failed to stop clat");
        std::process::exit(1);
    }
    info!("clat stopped");
}
