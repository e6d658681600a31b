//! Burstgen — multi-threaded UDP/ICMP packet generator.
//!
//! Usage:
//!   burstgen -I eth0 -m u -a <SRCMAC> -b <DSTMAC> -s <SRCIP> -d <DSTIP> [-n COUNT] [-x BURST]
//!   burstgen -I eth0 -m p -s <SRCIP> -d <DSTIP> -n 10 -t 3
//!   burstgen -I eth0,eth1 -m r -c 0xc

use burstgen::cli::{self, Cli};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    // Initialise logging (RUST_LOG=debug etc.), info by default.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = cli::run(&cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
