//! Packet templates, per-burst mutation and receive-side parsing.
//!
//! A transmit worker holds one [`PacketKind`] for the whole run. The kind
//! builds reference packets once at startup ([`PacketKind::build_reference`])
//! and stamps each one with a fresh sequence number before it is cloned for
//! sending ([`PacketKind::prepare`]). See [`burst`] for the clone step.

pub mod burst;
pub mod icmp;
pub mod parse;
pub mod udp;

use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::checksum;
use crate::pktio::{Packet, PacketPool, TxChecksum};
use crate::{AddressConfig, MacAddr, Mode};

pub use burst::{build_burst, build_reference_array};
pub use icmp::IcmpPacketKind;
pub use parse::parse_frame;
pub use udp::UdpPacketKind;

// ─────────────────────────────────────────────────────────────────────────────
// Wire constants
// ─────────────────────────────────────────────────────────────────────────────

pub const ETH_HLEN: usize = 14;
pub const IPV4_HLEN: usize = 20;
pub const UDP_HLEN: usize = 8;
pub const ICMP_HLEN: usize = 8;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_UDP: u8 = 17;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;

/// Echo request payload length, regardless of the configured payload size.
pub const ICMP_PAYLOAD_LEN: usize = 56;

pub const IP_DEFAULT_TTL: u8 = 64;

/// Offset of the IPv4 identification field inside the IPv4 header.
const IPV4_ID_OFFSET: usize = 4;
const IPV4_CSUM_OFFSET: usize = 10;
const UDP_CSUM_OFFSET: usize = 6;

/// Identification values wrap at this modulus.
const SEQ_MODULUS: u64 = 0xffff;

/// Burst construction failure. The burst is abandoned and every clone made
/// so far has been released.
#[derive(Debug, thiserror::Error)]
pub enum BurstError {
    #[error("packet pool exhausted at slot {slot} of {burst}")]
    PoolExhausted { slot: usize, burst: usize },

    #[error("{kind} frame of {len} bytes does not fit pool segments of {seg_len} bytes")]
    FrameTooLarge { kind: &'static str, len: usize, seg_len: usize },

    #[error("burst has no reference packets")]
    EmptyBurst,
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Template builder and per-packet mutator for one protocol.
pub trait PacketKind: Send + Sync {
    /// Short protocol name for logs and errors.
    fn name(&self) -> &'static str;

    /// Total frame length, Ethernet header included.
    fn frame_len(&self) -> usize;

    /// Build a fully populated reference packet. `None` when the pool has no
    /// free buffer (or the frame does not fit one).
    fn build_reference(&self, pool: &PacketPool, offload: &TxChecksum) -> Option<Packet>;

    /// Stamp `seq` into `pkt` and refresh every checksum it invalidates.
    fn prepare(&self, pkt: &mut Packet, offload: &TxChecksum, seq: u64);
}

/// Pick the packet kind for a transmitting mode. `Receive` never transmits.
pub fn kind_for(
    mode: Mode,
    addr: &AddressConfig,
    payload_len: usize,
) -> Option<Arc<dyn PacketKind>> {
    match mode {
        Mode::SendUdp => Some(Arc::new(UdpPacketKind::new(*addr, payload_len))),
        Mode::Ping => Some(Arc::new(IcmpPacketKind::new(*addr))),
        Mode::Receive => None,
    }
}

/// 16-bit identification value carried for running sequence number `seq`.
pub fn wrapped_seq(seq: u64) -> u16 {
    (seq % SEQ_MODULUS) as u16
}

// ─────────────────────────────────────────────────────────────────────────────
// Header writers shared by the kinds
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn write_eth(buf: &mut [u8], src: MacAddr, dst: MacAddr) {
    buf[0..6].copy_from_slice(&dst.octets());
    buf[6..12].copy_from_slice(&src.octets());
    buf[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
}

/// Write a minimal IPv4 header (no options, DF clear, id 0, checksum 0).
pub(crate) fn write_ipv4(
    buf: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    total_len: u16,
) {
    buf[0] = 0x45;
    buf[1] = 0;
    buf[2..4].copy_from_slice(&total_len.to_be_bytes());
    buf[4..8].fill(0);
    buf[8] = IP_DEFAULT_TTL;
    buf[9] = protocol;
    buf[10..12].fill(0);
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
}

pub(crate) fn set_ipv4_id(frame: &mut [u8], l3: usize, id: u16) {
    let off = l3 + IPV4_ID_OFFSET;
    frame[off..off + 2].copy_from_slice(&id.to_be_bytes());
}

pub(crate) fn ipv4_id(frame: &[u8], l3: usize) -> u16 {
    let off = l3 + IPV4_ID_OFFSET;
    u16::from_be_bytes([frame[off], frame[off + 1]])
}

/// Recompute the IPv4 header checksum in place.
pub fn fill_ipv4_checksum(frame: &mut [u8], l3: usize) {
    let ihl = ((frame[l3] & 0x0f) as usize) * 4;
    let csum_at = l3 + IPV4_CSUM_OFFSET;
    frame[csum_at..csum_at + 2].fill(0);
    let csum = checksum::internet_checksum(&frame[l3..l3 + ihl]);
    frame[csum_at..csum_at + 2].copy_from_slice(&csum.to_be_bytes());
}

/// Recompute the UDP checksum (pseudo-header included) in place.
pub fn fill_udp_checksum(frame: &mut [u8], l3: usize, l4: usize) {
    let src = ipv4_addr(frame, l3 + 12);
    let dst = ipv4_addr(frame, l3 + 16);
    let udp_len = u16::from_be_bytes([frame[l4 + 4], frame[l4 + 5]]) as usize;
    let csum_at = l4 + UDP_CSUM_OFFSET;
    frame[csum_at..csum_at + 2].fill(0);
    let mut csum = checksum::transport_checksum(src, dst, IPPROTO_UDP, &frame[l4..l4 + udp_len]);
    // RFC 768: a computed zero is sent as all ones.
    if csum == 0 {
        csum = 0xffff;
    }
    frame[csum_at..csum_at + 2].copy_from_slice(&csum.to_be_bytes());
}

pub(crate) fn ipv4_addr(frame: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(frame[at], frame[at + 1], frame[at + 2], frame[at + 3])
}

// ─────────────────────────────────────────────────────────────────────────────
// Timestamps
// ─────────────────────────────────────────────────────────────────────────────

/// Nanoseconds on a process-wide monotonic clock. Echo requests carry this
/// value so the receive side can compute round-trip time.
pub fn timestamp_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
