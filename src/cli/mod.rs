//! CLI entrypoint for burstgen.
//!
//! Parses arguments into a [`GeneratorConfig`], picks the packet-I/O backend,
//! runs the generator and prints statistics lines and the final report.

pub mod output;

use std::io::Write;
use std::net::Ipv4Addr;

use clap::{Parser, ValueEnum};

use crate::config::{
    CpuMask, GeneratorConfig, DEFAULT_INTERVAL_MS, DEFAULT_PAYLOAD, DEFAULT_STATS_INTERVAL_MS,
    DEFAULT_UDP_TX_BURST,
};
use crate::coordinator::{self, GenError};
use crate::pktio::af_packet::AfPacketBackend;
use crate::pktio::loopback::{LoopbackBackend, LoopbackOptions, Responder};
use crate::pktio::PktioBackend;
use crate::{AddressConfig, MacAddr, Mode};

pub use output::{format_json, format_pretty, format_stats_line};

// ─────────────────────────────────────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────────────────────────────────────

/// Burstgen — multi-threaded UDP/ICMP packet generator.
#[derive(Parser, Debug)]
#[command(name = "burstgen", version, about)]
#[command(
    long_about = "Burstgen builds UDP or ICMP echo packets and sends them in paced bursts from \
    CPU-pinned worker threads, or receives and classifies traffic, printing periodic send and \
    receive rates. The af-packet backend needs CAP_NET_RAW (sudo) on Linux."
)]
pub struct Cli {
    /// Interfaces to use, comma separated (eth0,eth1)
    #[arg(short = 'I', long = "interface", value_delimiter = ',', required = true)]
    pub interfaces: Vec<String>,

    /// Source MAC address
    #[arg(short = 'a', long, default_value = "00:00:00:00:00:00")]
    pub srcmac: MacAddr,

    /// Destination MAC address
    #[arg(short = 'b', long, default_value = "00:00:00:00:00:00")]
    pub dstmac: MacAddr,

    /// Source IPv4 address
    #[arg(short = 's', long, default_value = "0.0.0.0")]
    pub srcip: Ipv4Addr,

    /// Destination IPv4 address
    #[arg(short = 'd', long, default_value = "0.0.0.0")]
    pub dstip: Ipv4Addr,

    /// UDP source port
    #[arg(short = 'e', long, default_value = "0")]
    pub srcport: u16,

    /// UDP destination port
    #[arg(short = 'f', long, default_value = "0")]
    pub dstport: u16,

    /// UDP payload size in bytes (ICMP payload is fixed at 56)
    #[arg(short = 'p', long, default_value_t = DEFAULT_PAYLOAD)]
    pub packetsize: usize,

    /// Work mode
    #[arg(short = 'm', long, value_enum)]
    pub mode: ModeArg,

    /// Total packets to send (unlimited if omitted)
    #[arg(short = 'n', long)]
    pub count: Option<u64>,

    /// Ping: seconds to wait for outstanding replies after the last request
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Milliseconds between bursts; 0 sends as fast as possible
    #[arg(short = 'i', long, default_value_t = DEFAULT_INTERVAL_MS)]
    pub interval: u64,

    /// Number of worker threads (one per CPU if omitted)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Hexadecimal CPU mask for worker placement; overrides --workers
    #[arg(short = 'c', long)]
    pub cpumask: Option<CpuMask>,

    /// Packets per UDP burst
    #[arg(short = 'x', long = "udp-tx-burst", default_value_t = DEFAULT_UDP_TX_BURST)]
    pub udp_tx_burst: usize,

    /// Enable checksum offload where the interface supports it
    #[arg(short = 'y', long)]
    pub csum: bool,

    /// Milliseconds between statistics lines
    #[arg(long, default_value_t = DEFAULT_STATS_INTERVAL_MS)]
    pub stats_interval: u64,

    /// Output format
    #[arg(long, default_value = "pretty", value_enum)]
    pub output: OutputFmt,

    /// Packet I/O backend
    #[arg(long, default_value = "af-packet", value_enum)]
    pub backend: BackendArg,

    /// Do not pin workers to CPUs
    #[arg(long)]
    pub no_pin: bool,
}

/// Work mode argument.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    #[value(alias = "u", alias = "udp")]
    SendUdp,
    #[value(alias = "p")]
    Ping,
    #[value(alias = "r")]
    Receive,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::SendUdp => Mode::SendUdp,
            ModeArg::Ping => Mode::Ping,
            ModeArg::Receive => Mode::Receive,
        }
    }
}

/// Output format argument.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFmt {
    Pretty,
    Json,
}

/// Packet I/O backend argument.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendArg {
    /// Raw AF_PACKET sockets (Linux)
    AfPacket,
    /// In-memory interfaces that answer echo requests
    Loopback,
}

impl Cli {
    /// Build the run configuration from the parsed arguments.
    pub fn to_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            interfaces: self.interfaces.iter().map(|name| name.trim().to_string()).collect(),
            addresses: AddressConfig {
                src_mac: self.srcmac,
                dst_mac: self.dstmac,
                src_ip: self.srcip,
                dst_ip: self.dstip,
                src_port: self.srcport,
                dst_port: self.dstport,
            },
            mode: self.mode.into(),
            payload_len: self.packetsize,
            count: self.count,
            reply_timeout_secs: self.timeout,
            interval_ms: self.interval,
            udp_tx_burst: self.udp_tx_burst,
            workers: self.workers,
            cpu_mask: self.cpumask,
            checksum_offload: self.csum,
            stats_interval_ms: self.stats_interval,
            pin_cpus: !self.no_pin,
            ..Default::default()
        }
    }

    fn backend(&self) -> Box<dyn PktioBackend> {
        match self.backend {
            BackendArg::AfPacket => Box::new(AfPacketBackend),
            BackendArg::Loopback => Box::new(LoopbackBackend::new(LoopbackOptions {
                responder: Responder::EchoReply,
                ..Default::default()
            })),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

/// Run the generator and print everything to stdout.
pub fn run(cli: &Cli) -> Result<(), GenError> {
    let config = cli.to_config();
    let backend = cli.backend();
    let fmt = cli.output;

    let mut stdout = std::io::stdout();
    let report = coordinator::run(&config, backend.as_ref(), &mut |line| {
        let _ = writeln!(stdout, "{}", format_stats_line(line, fmt));
        let _ = stdout.flush();
    })?;

    match fmt {
        OutputFmt::Pretty => print!("{}", format_pretty(&report)),
        OutputFmt::Json => println!("{}", format_json(&report)),
    }
    Ok(())
}
