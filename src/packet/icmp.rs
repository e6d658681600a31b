//! Ethernet + IPv4 + ICMP echo template, echo reply helpers.
//!
//! Layout of the echo payload: an 8-byte big-endian send timestamp
//! ([`super::timestamp_ns`]) followed by zero padding up to
//! [`ICMP_PAYLOAD_LEN`] bytes. The ICMP sequence number mirrors the IPv4
//! identification field.

use super::{
    fill_ipv4_checksum, set_ipv4_id, timestamp_ns, wrapped_seq, write_eth, write_ipv4, PacketKind,
    ETH_HLEN, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ICMP_HLEN, ICMP_PAYLOAD_LEN, IPPROTO_ICMP,
    IPV4_HLEN,
};
use crate::checksum;
use crate::pktio::{Packet, PacketPool, TxChecksum};
use crate::AddressConfig;

const ICMP_CSUM_OFFSET: usize = 2;
const ICMP_SEQ_OFFSET: usize = 6;
const TIMESTAMP_LEN: usize = 8;

/// ICMP echo requests toward the configured destination.
#[derive(Debug, Clone)]
pub struct IcmpPacketKind {
    addr: AddressConfig,
}

impl IcmpPacketKind {
    pub fn new(addr: AddressConfig) -> Self {
        Self { addr }
    }
}

impl PacketKind for IcmpPacketKind {
    fn name(&self) -> &'static str {
        "icmp"
    }

    fn frame_len(&self) -> usize {
        ETH_HLEN + IPV4_HLEN + ICMP_HLEN + ICMP_PAYLOAD_LEN
    }

    fn build_reference(&self, pool: &PacketPool, offload: &TxChecksum) -> Option<Packet> {
        let mut pkt = pool.alloc(self.frame_len())?;
        let l3 = ETH_HLEN;
        let l4 = l3 + IPV4_HLEN;

        let data = pkt.data_mut();
        write_eth(&mut data[..l3], self.addr.src_mac, self.addr.dst_mac);
        write_ipv4(
            &mut data[l3..l4],
            self.addr.src_ip,
            self.addr.dst_ip,
            IPPROTO_ICMP,
            (IPV4_HLEN + ICMP_HLEN + ICMP_PAYLOAD_LEN) as u16,
        );
        data[l4] = ICMP_ECHO_REQUEST;
        // code, checksum, identifier and sequence start at zero
        data[l4 + 1..l4 + ICMP_HLEN].fill(0);

        if !offload.ipv4 {
            fill_ipv4_checksum(data, l3);
        }
        fill_icmp_checksum(data, l4);

        let meta = pkt.meta_mut();
        meta.set_offsets(0, l3 as u16, l4 as u16);
        meta.has_ipv4 = true;
        meta.has_icmp = true;
        meta.insert_ipv4_checksum = offload.ipv4;
        Some(pkt)
    }

    fn prepare(&self, pkt: &mut Packet, offload: &TxChecksum, seq: u64) {
        let l3 = ETH_HLEN;
        let l4 = l3 + IPV4_HLEN;
        let id = wrapped_seq(seq);

        let data = pkt.data_mut();
        set_ipv4_id(data, l3, id);
        if !offload.ipv4 {
            fill_ipv4_checksum(data, l3);
        }

        let seq_at = l4 + ICMP_SEQ_OFFSET;
        data[seq_at..seq_at + 2].copy_from_slice(&id.to_be_bytes());
        let ts_at = l4 + ICMP_HLEN;
        data[ts_at..ts_at + TIMESTAMP_LEN].copy_from_slice(&timestamp_ns().to_be_bytes());
        // ICMP checksums are never offloaded.
        fill_icmp_checksum(data, l4);
    }
}

/// Recompute the ICMP checksum over header and payload (to the frame end).
pub fn fill_icmp_checksum(frame: &mut [u8], l4: usize) {
    let csum_at = l4 + ICMP_CSUM_OFFSET;
    frame[csum_at..csum_at + 2].fill(0);
    let csum = checksum::internet_checksum(&frame[l4..]);
    frame[csum_at..csum_at + 2].copy_from_slice(&csum.to_be_bytes());
}

/// Decoded ICMP echo header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoHeader {
    pub icmp_type: u8,
    pub identifier: u16,
    pub sequence: u16,
    /// Send timestamp from the payload, if the payload is long enough.
    pub timestamp_ns: Option<u64>,
}

/// Decode the ICMP header at `l4`. `None` when the header is truncated.
pub fn decode_echo(frame: &[u8], l4: usize) -> Option<EchoHeader> {
    let icmp = frame.get(l4..l4 + ICMP_HLEN)?;
    let timestamp_ns = frame
        .get(l4 + ICMP_HLEN..l4 + ICMP_HLEN + TIMESTAMP_LEN)
        .map(|ts| u64::from_be_bytes([ts[0], ts[1], ts[2], ts[3], ts[4], ts[5], ts[6], ts[7]]));
    Some(EchoHeader {
        icmp_type: icmp[0],
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
        timestamp_ns,
    })
}

/// Turn an echo request frame into the matching echo reply in place: swap
/// MAC and IPv4 addresses, set the reply type and refresh both checksums.
pub fn make_echo_reply(frame: &mut [u8], l3: usize, l4: usize) {
    let (dst, src) = frame[..12].split_at_mut(6);
    dst.swap_with_slice(src);
    let (src_ip, dst_ip) = frame[l3 + 12..l3 + 20].split_at_mut(4);
    src_ip.swap_with_slice(dst_ip);
    fill_ipv4_checksum(frame, l3);
    frame[l4] = ICMP_ECHO_REPLY;
    fill_icmp_checksum(frame, l4);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ipv4_id;
    use std::net::Ipv4Addr;

    fn addr() -> AddressConfig {
        AddressConfig {
            src_mac: "02:00:00:00:00:01".parse().unwrap(),
            dst_mac: "02:00:00:00:00:02".parse().unwrap(),
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 0,
            dst_port: 0,
        }
    }

    const L4: usize = ETH_HLEN + IPV4_HLEN;

    #[test]
    fn test_reference_is_echo_request_with_fixed_payload() {
        let pool = PacketPool::new(2, 2048);
        let pkt = IcmpPacketKind::new(addr())
            .build_reference(&pool, &TxChecksum::default())
            .unwrap();
        assert_eq!(pkt.len(), 14 + 20 + 8 + 56);
        assert_eq!(pkt.data()[23], IPPROTO_ICMP);
        assert_eq!(pkt.data()[L4], ICMP_ECHO_REQUEST);
        assert_eq!(pkt.data()[L4 + 1], 0, "code");
        assert!(checksum::verify(&pkt.data()[L4..]), "ICMP checksum");
        assert!(checksum::verify(&pkt.data()[14..34]), "IPv4 checksum");
    }

    #[test]
    fn test_prepare_mirrors_id_and_stamps_time() {
        let pool = PacketPool::new(2, 2048);
        let kind = IcmpPacketKind::new(addr());
        let offload = TxChecksum::default();
        let mut pkt = kind.build_reference(&pool, &offload).unwrap();

        let before = timestamp_ns();
        kind.prepare(&mut pkt, &offload, 3);
        let after = timestamp_ns();

        let echo = decode_echo(pkt.data(), L4).unwrap();
        assert_eq!(ipv4_id(pkt.data(), ETH_HLEN), 3);
        assert_eq!(echo.sequence, 3, "ICMP sequence mirrors the IPv4 id");
        let ts = echo.timestamp_ns.unwrap();
        assert!(before <= ts && ts <= after, "timestamp taken during prepare");
        assert!(checksum::verify(&pkt.data()[L4..]), "ICMP checksum after stamping");
        assert!(checksum::verify(&pkt.data()[14..34]));
    }

    #[test]
    fn test_ipv4_offload_still_computes_icmp_checksum() {
        let pool = PacketPool::new(2, 2048);
        let kind = IcmpPacketKind::new(addr());
        let offload = TxChecksum { ipv4: true, udp: true };
        let mut pkt = kind.build_reference(&pool, &offload).unwrap();
        kind.prepare(&mut pkt, &offload, 9);
        assert_eq!(&pkt.data()[24..26], &[0, 0]);
        assert!(pkt.meta().insert_ipv4_checksum);
        assert!(!pkt.meta().insert_udp_checksum);
        assert!(checksum::verify(&pkt.data()[L4..]));
    }

    #[test]
    fn test_make_echo_reply_swaps_and_verifies() {
        let pool = PacketPool::new(2, 2048);
        let kind = IcmpPacketKind::new(addr());
        let offload = TxChecksum::default();
        let mut pkt = kind.build_reference(&pool, &offload).unwrap();
        kind.prepare(&mut pkt, &offload, 42);
        let request = decode_echo(pkt.data(), L4).unwrap();

        make_echo_reply(pkt.data_mut(), ETH_HLEN, L4);
        let d = pkt.data();
        assert_eq!(&d[0..6], &[2, 0, 0, 0, 0, 1], "reply goes back to the sender MAC");
        assert_eq!(&d[26..30], &[10, 0, 0, 2]);
        assert_eq!(&d[30..34], &[10, 0, 0, 1]);

        let reply = decode_echo(d, L4).unwrap();
        assert_eq!(reply.icmp_type, ICMP_ECHO_REPLY);
        assert_eq!(reply.sequence, 42);
        assert_eq!(reply.timestamp_ns, request.timestamp_ns, "payload echoed unchanged");
        assert!(checksum::verify(&d[L4..]));
        assert!(checksum::verify(&d[14..34]));
    }

    #[test]
    fn test_decode_truncated_header() {
        assert!(decode_echo(&[0u8; 40], L4).is_none());
    }
}
