//! Packet I/O: buffer pool, interfaces and their input/output queues.
//!
//! Workers only see the traits defined here. Two backends implement them:
//!
//! * [`loopback::LoopbackBackend`] — in-memory interfaces with configurable
//!   offload capability, backpressure and an ICMP echo responder. Used by the
//!   tests and by `--backend loopback`.
//! * [`af_packet::AfPacketBackend`] — Linux `AF_PACKET` raw sockets, one per
//!   queue, with `sendmmsg` batching and `PACKET_FANOUT` input spreading.

pub mod af_packet;
pub mod loopback;
pub mod pool;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use pool::{Packet, PacketPool, PoolStats};

/// Error from the packet I/O layer.
#[derive(Debug, thiserror::Error)]
pub enum PktioError {
    #[error("pktio open failed for {name}: {reason}")]
    Open { name: String, reason: String },

    #[error("interface {name} configuration failed: {reason}")]
    Config { name: String, reason: String },

    #[error("interface {name}: {reason}")]
    State { name: String, reason: String },

    #[error("packet send failed: {0}")]
    Send(String),

    #[error("packet receive failed: {0}")]
    Recv(String),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// Per-packet checksum validation outcome reported by the input path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ChecksumStatus {
    /// Not checked (offload disabled, or protocol not covered).
    #[default]
    Unknown,
    Good,
    Bad,
}

/// Parse results and offload requests attached to a packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMeta {
    pub l2_offset: Option<u16>,
    pub l3_offset: Option<u16>,
    pub l4_offset: Option<u16>,
    pub has_ipv4: bool,
    pub has_udp: bool,
    pub has_icmp: bool,
    /// Parse/protocol error detected on input.
    pub has_error: bool,
    pub l3_checksum: ChecksumStatus,
    pub l4_checksum: ChecksumStatus,
    /// Ask the output path to fill in the IPv4 header checksum.
    pub insert_ipv4_checksum: bool,
    /// Ask the output path to fill in the UDP checksum.
    pub insert_udp_checksum: bool,
}

impl PacketMeta {
    /// Record L2/L3/L4 header offsets (needed by checksum insertion).
    pub fn set_offsets(&mut self, l2: u16, l3: u16, l4: u16) {
        self.l2_offset = Some(l2);
        self.l3_offset = Some(l3);
        self.l4_offset = Some(l4);
    }
}

/// Input-direction checksum settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxChecksum {
    /// Validate IPv4 header checksums.
    pub ipv4: bool,
    /// Validate UDP checksums.
    pub udp: bool,
    /// Flag packets with a bad IPv4 checksum as errors.
    pub drop_ipv4_err: bool,
    /// Flag packets with a bad UDP checksum as errors.
    pub drop_udp_err: bool,
}

/// Output-direction checksum settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxChecksum {
    /// IPv4 header checksum is computed by the interface.
    pub ipv4: bool,
    /// UDP checksum is computed by the interface.
    pub udp: bool,
}

/// Effective (or advertised) checksum offload for both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumOffload {
    pub rx: RxChecksum,
    pub tx: TxChecksum,
}

impl ChecksumOffload {
    /// Enable everything the interface can do when `enable` is set,
    /// otherwise explicitly disable all offloads.
    pub fn negotiate(capability: &ChecksumOffload, enable: bool) -> Self {
        if enable {
            *capability
        } else {
            Self::default()
        }
    }
}

/// What an interface can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub max_input_queues: usize,
    pub max_output_queues: usize,
    pub checksum: ChecksumOffload,
}

/// Output queue. Implementations must tolerate concurrent callers when the
/// interface was configured with fewer queues than transmit workers.
pub trait PktOut: Send + Sync {
    /// Send as many packets from the front of `pkts` as the queue accepts.
    ///
    /// Accepted packets are removed from `pkts`; the unaccepted suffix stays
    /// with the caller. Returns the accepted count, which may be zero.
    fn send(&self, pkts: &mut Vec<Packet>) -> Result<usize, PktioError>;
}

/// Input queue, polled without blocking.
pub trait PktIn: Send + Sync {
    /// Append up to `max` received packets to `out`. Returns the count.
    fn recv(&self, out: &mut Vec<Packet>, max: usize) -> Result<usize, PktioError>;
}

/// An opened network endpoint. Closing is dropping.
pub trait Interface: Send {
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    /// Apply the negotiated checksum configuration.
    fn configure(&mut self, config: &ChecksumOffload) -> Result<(), PktioError>;

    /// Configure `num` input queues (already clamped by the caller).
    fn config_input_queues(&mut self, num: usize) -> Result<(), PktioError>;

    /// Configure `num` output queues. `mt_safe` is set when queues will be
    /// shared between threads.
    fn config_output_queues(&mut self, num: usize, mt_safe: bool) -> Result<(), PktioError>;

    fn start(&mut self) -> Result<(), PktioError>;

    fn stop(&mut self) -> Result<(), PktioError>;

    fn output_queues(&self) -> Result<Vec<Arc<dyn PktOut>>, PktioError>;

    fn input_queues(&self) -> Result<Vec<Arc<dyn PktIn>>, PktioError>;
}

/// Opens interfaces by name.
pub trait PktioBackend: Send + Sync {
    fn open(&self, name: &str, pool: &PacketPool) -> Result<Box<dyn Interface>, PktioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_enabled_copies_capability() {
        let capa = ChecksumOffload {
            rx: RxChecksum { ipv4: true, udp: true, drop_ipv4_err: true, drop_udp_err: false },
            tx: TxChecksum { ipv4: true, udp: false },
        };
        assert_eq!(ChecksumOffload::negotiate(&capa, true), capa);
    }

    #[test]
    fn test_negotiate_disabled_clears_everything() {
        let capa = ChecksumOffload {
            rx: RxChecksum { ipv4: true, udp: true, drop_ipv4_err: true, drop_udp_err: true },
            tx: TxChecksum { ipv4: true, udp: true },
        };
        assert_eq!(ChecksumOffload::negotiate(&capa, false), ChecksumOffload::default());
    }
}
