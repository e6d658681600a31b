//! Run configuration, validation and derived run plan.
//!
//! [`GeneratorConfig`] mirrors the command line. [`GeneratorConfig::plan`]
//! checks it against the machine and derives everything the coordinator
//! needs: worker count, CPU placement, burst size, queue counts, per-worker
//! packet ceilings and sequence stepping. Every error here is fatal and is
//! reported before any worker starts.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::packet::{ETH_HLEN, IPV4_HLEN, UDP_HLEN};
use crate::timer::MAX_TIMEOUT;
use crate::{AddressConfig, Mode};

/// Maximum number of worker threads.
pub const MAX_WORKERS: usize = 32;
/// Packets in the shared pool.
pub const POOL_NUM_PKT: usize = 2048;
/// Bytes per pool buffer.
pub const POOL_PKT_LEN: usize = 1856;
pub const DEFAULT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_UDP_TX_BURST: usize = 16;
pub const MAX_UDP_TX_BURST: usize = 512;
/// Packets drained from input queues per poll.
pub const MAX_RX_BURST: usize = 32;
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 20_000;
pub const DEFAULT_PAYLOAD: usize = 56;
/// Coordinator polling granularity.
pub const DEFAULT_TICK_MS: u64 = 1000;

/// Fatal configuration problem.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no interfaces given")]
    NoInterfaces,

    #[error("empty interface name in list")]
    EmptyInterfaceName,

    #[error("at least 1 worker required")]
    NoWorkers,

    #[error("{requested} workers requested, at most {max} supported")]
    TooManyWorkers { requested: usize, max: usize },

    #[error("ping mode needs 2 workers (one sender, one receiver), got {workers}")]
    PingNeedsTwoWorkers { workers: usize },

    #[error("invalid CPU mask '{0}'")]
    BadCpuMask(String),

    #[error("wrong cpu mask: CPU {cpu} not available (max cpu's: {available})")]
    CpuUnavailable { cpu: usize, available: usize },

    #[error("wrong UDP tx burst size {burst} (1..={max})")]
    BurstOutOfRange { burst: usize, max: usize },

    #[error("payload of {payload} bytes gives a {frame}-byte frame, pool buffers hold {seg_len}")]
    PayloadTooLarge { payload: usize, frame: usize, seg_len: usize },

    #[error("packet count must be positive")]
    ZeroCount,

    #[error("{0} must be positive")]
    ZeroInterval(&'static str),

    #[error("interval of {interval_ms} ms exceeds the {max_ms} ms timer limit")]
    IntervalTooLong { interval_ms: u64, max_ms: u64 },
}

// ─────────────────────────────────────────────────────────────────────────────
// CPU mask
// ─────────────────────────────────────────────────────────────────────────────

/// Set of CPUs given as a hexadecimal bit mask (`0xc`, `c`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuMask(u64);

impl CpuMask {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// CPU indices in ascending order.
    pub fn cpus(&self) -> Vec<usize> {
        (0..64).filter(|cpu| self.0 & (1u64 << cpu) != 0).collect()
    }
}

impl FromStr for CpuMask {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bits =
            u64::from_str_radix(digits, 16).map_err(|_| ConfigError::BadCpuMask(s.to_string()))?;
        if bits == 0 {
            return Err(ConfigError::BadCpuMask(s.to_string()));
        }
        Ok(Self(bits))
    }
}

impl std::fmt::Display for CpuMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generator configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Every option of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub interfaces: Vec<String>,
    pub addresses: AddressConfig,
    pub mode: Mode,
    /// UDP payload bytes. Echo requests always carry 56.
    pub payload_len: usize,
    /// Stop after this many packets in total; `None` runs until interrupted.
    pub count: Option<u64>,
    /// Ping mode: seconds to wait for outstanding replies once `count`
    /// requests are out. `None` stops without waiting.
    pub reply_timeout_secs: Option<u64>,
    /// Pause between bursts; 0 floods.
    pub interval_ms: u64,
    pub udp_tx_burst: usize,
    /// Worker count; defaults to one per available CPU.
    pub workers: Option<usize>,
    /// Explicit CPU placement, overriding `workers`.
    pub cpu_mask: Option<CpuMask>,
    /// Enable every checksum offload the interfaces support.
    pub checksum_offload: bool,
    pub stats_interval_ms: u64,
    pub tick_ms: u64,
    /// Spacing of reply checks during the ping graceful stop.
    pub reply_poll_ms: u64,
    pub pin_cpus: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            addresses: AddressConfig::default(),
            mode: Mode::SendUdp,
            payload_len: DEFAULT_PAYLOAD,
            count: None,
            reply_timeout_secs: None,
            interval_ms: DEFAULT_INTERVAL_MS,
            udp_tx_burst: DEFAULT_UDP_TX_BURST,
            workers: None,
            cpu_mask: None,
            checksum_offload: false,
            stats_interval_ms: DEFAULT_STATS_INTERVAL_MS,
            tick_ms: DEFAULT_TICK_MS,
            reply_poll_ms: 1000,
            pin_cpus: true,
        }
    }
}

/// Everything derived from a validated configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPlan {
    pub workers: usize,
    /// CPU for each worker index.
    pub cpus: Vec<usize>,
    /// Packets per transmitted burst (0 in receive mode).
    pub tx_burst: usize,
    /// Input queues requested per interface.
    pub rx_queues: usize,
    /// Output queues requested per interface.
    pub tx_queues: usize,
    /// Per transmit worker: stop transmitting once this many are sent.
    pub pkt_count_max: Option<u64>,
    /// Sequence advance after each burst.
    pub seq_step: u64,
}

impl GeneratorConfig {
    /// Validate against the CPUs of this machine.
    pub fn plan(&self) -> Result<RunPlan, ConfigError> {
        let available = std::thread::available_parallelism().map_or(1, |n| n.get());
        self.plan_for_cpus(available)
    }

    /// Validate against a machine with `available` CPUs.
    pub fn plan_for_cpus(&self, available: usize) -> Result<RunPlan, ConfigError> {
        if self.interfaces.is_empty() {
            return Err(ConfigError::NoInterfaces);
        }
        if self.interfaces.iter().any(|name| name.trim().is_empty()) {
            return Err(ConfigError::EmptyInterfaceName);
        }
        if self.count == Some(0) {
            return Err(ConfigError::ZeroCount);
        }
        if self.stats_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("stats interval"));
        }
        if self.tick_ms == 0 {
            return Err(ConfigError::ZeroInterval("tick"));
        }
        if self.reply_poll_ms == 0 {
            return Err(ConfigError::ZeroInterval("reply poll interval"));
        }
        if Duration::from_millis(self.interval_ms) > MAX_TIMEOUT {
            return Err(ConfigError::IntervalTooLong {
                interval_ms: self.interval_ms,
                max_ms: MAX_TIMEOUT.as_millis() as u64,
            });
        }
        if self.mode == Mode::SendUdp {
            if self.udp_tx_burst == 0 || self.udp_tx_burst > MAX_UDP_TX_BURST {
                return Err(ConfigError::BurstOutOfRange {
                    burst: self.udp_tx_burst,
                    max: MAX_UDP_TX_BURST,
                });
            }
            let frame = ETH_HLEN + IPV4_HLEN + UDP_HLEN + self.payload_len;
            if frame > POOL_PKT_LEN {
                return Err(ConfigError::PayloadTooLarge {
                    payload: self.payload_len,
                    frame,
                    seg_len: POOL_PKT_LEN,
                });
            }
        }

        let mut cpus = match self.cpu_mask {
            Some(mask) => {
                let cpus = mask.cpus();
                if let Some(&cpu) = cpus.iter().find(|&&cpu| cpu >= available) {
                    return Err(ConfigError::CpuUnavailable { cpu, available });
                }
                cpus
            }
            None => {
                let workers = self.workers.unwrap_or(available.min(MAX_WORKERS));
                (0..workers).map(|i| i % available.max(1)).collect()
            }
        };

        let mut workers = cpus.len();
        if workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if workers > MAX_WORKERS {
            return Err(ConfigError::TooManyWorkers { requested: workers, max: MAX_WORKERS });
        }
        if self.mode == Mode::Ping {
            if workers < 2 {
                return Err(ConfigError::PingNeedsTwoWorkers { workers });
            }
            if workers > 2 {
                warn!(requested = workers, "ping mode uses exactly 2 workers");
                workers = 2;
                cpus.truncate(2);
            }
        }

        let if_count = self.interfaces.len();
        let (tx_burst, rx_queues, tx_queues, pkt_count_max, seq_step) = match self.mode {
            Mode::SendUdp => (
                self.udp_tx_burst,
                1,
                workers.div_ceil(if_count),
                self.count.map(|n| n.div_ceil(workers as u64)),
                (self.udp_tx_burst * (workers - 1)) as u64,
            ),
            Mode::Ping => (1, 1, 1, self.count, 0),
            Mode::Receive => (0, workers, 1, None, 0),
        };

        Ok(RunPlan {
            workers,
            cpus,
            tx_burst,
            rx_queues,
            tx_queues,
            pkt_count_max,
            seq_step,
        })
    }
}
